//! End-to-end client/server round trips against an in-memory database,
//! plus the hint-table invariants the protocol relies on.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use plinko::db::Database;
use plinko::engine::ClientEngine;
use plinko::hint::{HintState, Membership};
use plinko::iprf::Iprf;
use plinko::params::{
    derive_block_key, derive_membership_key, xor_entry, BinomialMode, Entry, PirParams,
    ENTRY_SIZE,
};
use plinko::wire::{decode_parity, encode_parity};
use plinko::PirError;

fn counter_entries(n: u64) -> Vec<Entry> {
    (0..n)
        .map(|i| {
            let mut entry = [0u8; ENTRY_SIZE];
            entry[0..8].copy_from_slice(&(i + 1).to_le_bytes());
            entry
        })
        .collect()
}

fn word(entry: &Entry) -> u64 {
    u64::from_le_bytes(entry[0..8].try_into().unwrap())
}

/// Full protocol round trip: query, server fold, decimal wire encoding,
/// reconstruction.
fn private_read(engine: &mut ClientEngine, server: &Database, target: u64) -> Entry {
    let (request, pending) = engine.query(target).expect("usable hint");
    let parity = server.punctured_parity(&request).expect("well-formed query");
    let over_the_wire = decode_parity(&encode_parity(&parity)).unwrap();
    engine.reconstruct(pending, &over_the_wire)
}

#[test]
fn query_and_reconstruct_return_the_stored_word() {
    let entries = counter_entries(16);
    let server = Database::from_entries(&entries);
    assert_eq!(server.chunk_size(), 8);
    assert_eq!(server.set_size(), 4);

    let params = PirParams::derive(16, 32, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([0u8; 32], params, ChaCha20Rng::seed_from_u64(1));
    engine.hint_init(&entries);

    let unused_before = engine.hints().unused_count();
    let value = private_read(&mut engine, &server, 5);
    assert_eq!(word(&value), 6);

    // One hint consumed, one backup promoted in its place.
    assert_eq!(engine.consumed_queries(), 1);
    assert_eq!(engine.hints().unused_count(), unused_before);
    assert_eq!(engine.hints().backup_count(), params.backup_hints() - 1);
}

#[test]
fn delta_then_requery_returns_the_updated_word() {
    let mut entries = counter_entries(16);
    let params = PirParams::derive(16, 32, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([0u8; 32], params, ChaCha20Rng::seed_from_u64(2));
    engine.hint_init(&entries);

    let mut delta = [0u8; ENTRY_SIZE];
    delta[0] = 0x07;

    // Server and client both move to the new database state.
    xor_entry(&mut entries[5], &delta);
    let server = Database::from_entries(&entries);
    engine.apply_delta_batch(1, &[(5, delta)]);
    assert_eq!(engine.delta_height(), 1);

    // D[5] = 6 ^ 7 = 1.
    let value = private_read(&mut engine, &server, 5);
    assert_eq!(word(&value), 1);
}

#[test]
fn thousand_queries_consume_distinct_hints_without_errors() {
    let entries = counter_entries(512);
    let server = Database::from_entries(&entries);

    let params = PirParams::derive(512, 256, 2048, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([7u8; 32], params, ChaCha20Rng::seed_from_u64(3));
    engine.hint_init(&entries);

    let mut rng = ChaCha20Rng::seed_from_u64(99);
    let mut consumed_hints = Vec::with_capacity(1024);

    for round in 0..1024u64 {
        let target = rng.gen_range(0..512);
        let (request, pending) = engine
            .query(target)
            .unwrap_or_else(|e| panic!("round {round}: {e}"));
        consumed_hints.push(pending.hint_index());

        let parity = server.punctured_parity(&request).unwrap();
        let value = engine.reconstruct(pending, &parity);
        assert_eq!(word(&value), target + 1, "round {round} target {target}");
    }

    consumed_hints.sort_unstable();
    consumed_hints.dedup();
    assert_eq!(consumed_hints.len(), 1024, "a hint answered two queries");
}

#[test]
fn every_target_reconstructs_on_an_honest_server() {
    let entries = counter_entries(100);
    let server = Database::from_entries(&entries);

    let params = PirParams::derive(100, 64, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([9u8; 32], params, ChaCha20Rng::seed_from_u64(4));
    engine.hint_init(&entries);

    for target in 0..100 {
        let value = private_read(&mut engine, &server, target);
        assert_eq!(word(&value), target + 1, "target {target}");
    }
}

/// Recompute invariant I1 from scratch: every unused or backup hint's
/// parity equals the XOR of its covered entries.
fn assert_hint_integrity(engine: &ClientEngine, entries: &[Entry]) {
    let params = *engine.params();
    let master = *engine.master_secret();
    let membership = Membership::new(derive_membership_key(&master));
    let iprfs: Vec<Iprf> = (0..params.set_size)
        .map(|alpha| {
            Iprf::new(
                derive_block_key(&master, alpha),
                params.hint_domain(),
                params.chunk_size,
                params.binomial_mode,
            )
        })
        .collect();

    for j in 0..engine.hints().len() {
        if engine.hints().state(j) == HintState::Consumed {
            continue;
        }
        let mut expected = [0u8; ENTRY_SIZE];
        for alpha in 0..params.set_size {
            if !membership.contains(j, alpha) {
                continue;
            }
            let index = alpha * params.chunk_size + iprfs[alpha as usize].forward(j);
            if index < entries.len() as u64 {
                xor_entry(&mut expected, &entries[index as usize]);
            }
        }
        assert_eq!(engine.hints().parity(j), &expected, "hint {j} violates integrity");
    }
}

#[test]
fn hint_integrity_holds_after_arbitrary_updates() {
    let mut entries = counter_entries(16);
    let params = PirParams::derive(16, 8, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([3u8; 32], params, ChaCha20Rng::seed_from_u64(5));
    engine.hint_init(&entries);
    assert_hint_integrity(&engine, &entries);

    let mut rng = ChaCha20Rng::seed_from_u64(6);
    let mut height = 0;
    for _ in 0..40 {
        let index = rng.gen_range(0..16u64);
        let mut delta = [0u8; ENTRY_SIZE];
        rng.fill(&mut delta[..]);

        xor_entry(&mut entries[index as usize], &delta);
        height += 1;
        engine.apply_delta_batch(height, &[(index, delta)]);
    }
    assert_hint_integrity(&engine, &entries);
}

#[test]
fn applying_the_same_delta_twice_is_a_no_op() {
    let entries = counter_entries(16);
    let params = PirParams::derive(16, 8, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([4u8; 32], params, ChaCha20Rng::seed_from_u64(7));
    engine.hint_init(&entries);

    let before = engine.hints().parity_bytes().to_vec();
    let mut delta = [0u8; ENTRY_SIZE];
    delta[2] = 0x99;
    delta[30] = 0x01;

    engine.apply_delta(11, &delta);
    assert_ne!(engine.hints().parity_bytes(), &before[..]);
    engine.apply_delta(11, &delta);
    assert_eq!(engine.hints().parity_bytes(), &before[..]);
}

#[test]
fn punctured_sets_cover_blocks_uniformly() {
    let entries = counter_entries(512);
    let params = PirParams::derive(512, 256, 2048, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([5u8; 32], params, ChaCha20Rng::seed_from_u64(8));
    engine.hint_init(&entries);

    let k = params.set_size;
    let mut rng = ChaCha20Rng::seed_from_u64(9);
    let mut in_set = vec![0u64; k as usize];
    let mut eligible = vec![0u64; k as usize];

    for _ in 0..1024 {
        let target = rng.gen_range(0..512);
        let alpha_star = target / params.chunk_size;
        let (request, pending) = engine.query(target).unwrap();

        for alpha in 0..k {
            if alpha == alpha_star {
                continue;
            }
            eligible[alpha as usize] += 1;
            if request.p.contains(&alpha) {
                in_set[alpha as usize] += 1;
            }
        }
        // Selection statistics only; leave the hint population intact.
        engine.cancel(pending);
    }

    // Each non-target block lands in P' with probability 1/2; with ~900
    // samples per block anything outside this band signals structure.
    for alpha in 0..k as usize {
        let freq = in_set[alpha] as f64 / eligible[alpha] as f64;
        assert!(
            (0.35..=0.65).contains(&freq),
            "block {alpha} membership frequency {freq:.3}"
        );
    }
}

#[test]
fn hammering_one_cell_exhausts_it_and_refresh_recovers() {
    let entries = counter_entries(16);
    let server = Database::from_entries(&entries);
    let params = PirParams::derive(16, 32, 1024, BinomialMode::NormalApprox);
    let mut engine = ClientEngine::with_rng([6u8; 32], params, ChaCha20Rng::seed_from_u64(10));
    engine.hint_init(&entries);

    // The candidate set for one cell is finite and consumed hints never
    // return, so repeating a single target must eventually run it dry.
    let mut exhausted = false;
    for _ in 0..256 {
        match engine.query(5) {
            Ok((request, pending)) => {
                let parity = server.punctured_parity(&request).unwrap();
                let value = engine.reconstruct(pending, &parity);
                assert_eq!(word(&value), 6);
            }
            Err(PirError::HintExhausted { block, offset }) => {
                assert_eq!((block, offset), (0, 5));
                exhausted = true;
                break;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert!(exhausted, "candidate set never ran dry");

    // Refresh rotates the secret and restores service.
    let secret_before = *engine.master_secret();
    engine.refresh(&entries);
    assert_ne!(*engine.master_secret(), secret_before);
    let value = private_read(&mut engine, &server, 5);
    assert_eq!(word(&value), 6);
}

#[test]
fn cache_round_trip_preserves_engine_state() {
    use plinko::cache::{decode_hint_cache, encode_hint_cache, CacheKey, HINT_FORMAT_VERSION};

    let entries = counter_entries(16);
    let server = Database::from_entries(&entries);
    let params = PirParams::derive(16, 32, 1024, BinomialMode::NormalApprox);

    let mut engine = ClientEngine::with_rng([8u8; 32], params, ChaCha20Rng::seed_from_u64(11));
    engine.hint_init(&entries);
    let first = private_read(&mut engine, &server, 3);
    assert_eq!(word(&first), 4);

    let key = CacheKey::new(
        HINT_FORMAT_VERSION,
        params.binomial_mode,
        &[0xCC; 32],
        engine.master_secret(),
    );
    let blob = encode_hint_cache(&key, engine.hints(), engine.delta_height(), engine.consumed_queries());

    // A second process restores the cache instead of re-initializing.
    let (table, height, consumed) = decode_hint_cache(&blob, &key).unwrap();
    let mut restored = ClientEngine::with_rng([8u8; 32], params, ChaCha20Rng::seed_from_u64(12));
    restored.restore_hints(table, height, consumed).unwrap();
    assert_eq!(restored.consumed_queries(), 1);

    let value = private_read(&mut restored, &server, 9);
    assert_eq!(word(&value), 10);
}
