//! Client-side PIR engine.
//!
//! Owns the per-block iPRF instances, the hint table, and the result
//! cache. All methods are synchronous and I/O-free: the network layer
//! lives in the client binary, which serializes queries against delta
//! application so a hint's parity always matches the database state the
//! server answers from.

use std::collections::HashMap;

use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::error::PirError;
use crate::hint::{HintState, HintTable, Membership};
use crate::iprf::Iprf;
use crate::params::{
    derive_block_key, derive_membership_key, xor_entry, Entry, PirParams, ENTRY_SIZE,
};
use crate::wire::QueryRequest;

/// Handle for a query in flight: keeps the selected hint reserved until
/// the response is reconstructed or the query is cancelled.
pub struct PendingQuery {
    target: u64,
    hint: u64,
    block: u64,
}

impl PendingQuery {
    pub fn target(&self) -> u64 {
        self.target
    }

    pub fn hint_index(&self) -> u64 {
        self.hint
    }
}

pub struct ClientEngine {
    params: PirParams,
    master_secret: [u8; 32],
    iprfs: Vec<Iprf>,
    membership: Membership,
    hints: HintTable,
    cache: HashMap<u64, Entry>,
    delta_height: u64,
    consumed: u64,
    rng: ChaCha20Rng,
}

impl ClientEngine {
    pub fn new(master_secret: [u8; 32], params: PirParams) -> Self {
        Self::with_rng(master_secret, params, ChaCha20Rng::from_entropy())
    }

    /// Engine with a caller-provided CSPRNG (deterministic tests).
    pub fn with_rng(master_secret: [u8; 32], params: PirParams, rng: ChaCha20Rng) -> Self {
        Self {
            iprfs: Self::derive_iprfs(&master_secret, &params),
            membership: Membership::new(derive_membership_key(&master_secret)),
            hints: HintTable::new(params.num_hints(), params.backup_hints()),
            cache: HashMap::new(),
            delta_height: 0,
            consumed: 0,
            master_secret,
            params,
            rng,
        }
    }

    fn derive_iprfs(master_secret: &[u8; 32], params: &PirParams) -> Vec<Iprf> {
        (0..params.set_size)
            .map(|alpha| {
                Iprf::new(
                    derive_block_key(master_secret, alpha),
                    params.hint_domain(),
                    params.chunk_size,
                    params.binomial_mode,
                )
            })
            .collect()
    }

    pub fn params(&self) -> &PirParams {
        &self.params
    }

    pub fn master_secret(&self) -> &[u8; 32] {
        &self.master_secret
    }

    pub fn hints(&self) -> &HintTable {
        &self.hints
    }

    pub fn delta_height(&self) -> u64 {
        self.delta_height
    }

    pub fn consumed_queries(&self) -> u64 {
        self.consumed
    }

    /// Offline phase: stream the snapshot once and accumulate every
    /// hint parity. Entry `i = alpha*m + beta` lands in exactly the hints
    /// `j` with `iprf_alpha.forward(j) = beta` and `alpha` in `P_j`, so
    /// the total work is `O(N + k*H)` rather than `O(N*H)`.
    pub fn hint_init(&mut self, db: &[Entry]) {
        let buf_len = self.params.hint_domain() as usize * ENTRY_SIZE;

        #[cfg(feature = "parallel")]
        let merged: Vec<u8> = {
            use rayon::prelude::*;

            let this = &*self;
            (0..this.params.set_size)
                .into_par_iter()
                .fold(
                    || vec![0u8; buf_len],
                    |mut acc, alpha| {
                        this.fold_block(alpha, db, &mut acc);
                        acc
                    },
                )
                .reduce(
                    || vec![0u8; buf_len],
                    |mut a, b| {
                        for (x, y) in a.iter_mut().zip(b.iter()) {
                            *x ^= y;
                        }
                        a
                    },
                )
        };

        #[cfg(not(feature = "parallel"))]
        let merged: Vec<u8> = {
            let mut acc = vec![0u8; buf_len];
            for alpha in 0..self.params.set_size {
                self.fold_block(alpha, db, &mut acc);
            }
            acc
        };

        self.hints =
            HintTable::with_parities(self.params.num_hints(), self.params.backup_hints(), merged);
        self.cache.clear();
        self.consumed = 0;
    }

    /// Fold one block's entries into a partial parity buffer.
    fn fold_block(&self, alpha: u64, db: &[Entry], parities: &mut [u8]) {
        let m = self.params.chunk_size;
        let start = alpha * m;
        let end = (start + m).min(db.len() as u64).min(self.params.n_raw);
        if start >= end {
            return;
        }

        let iprf = &self.iprfs[alpha as usize];
        for i in start..end {
            let beta = i - start;
            let entry = &db[i as usize];
            for j in iprf.inverse(beta) {
                if self.membership.contains(j, alpha) {
                    let offset = j as usize * ENTRY_SIZE;
                    let slot: &mut Entry = (&mut parities[offset..offset + ENTRY_SIZE])
                        .try_into()
                        .unwrap();
                    xor_entry(slot, entry);
                }
            }
        }
    }

    /// Entry already recovered by an earlier query, if still valid.
    pub fn cached(&self, target: u64) -> Option<&Entry> {
        self.cache.get(&target)
    }

    /// Build the privacy-preserving query for `target`.
    ///
    /// The selected hint is fresh (never queried) and drawn uniformly at
    /// random among the usable candidates, so the emitted `(P', offsets)`
    /// pair is distributed like a fresh uniform hint sample with the
    /// target block punctured out; the server learns nothing about the
    /// target. The hint stays reserved until [`Self::reconstruct`] or
    /// [`Self::cancel`].
    pub fn query(&mut self, target: u64) -> Result<(QueryRequest, PendingQuery), PirError> {
        assert!(target < self.params.n_raw, "query target outside database");

        let m = self.params.chunk_size;
        let alpha_star = target / m;
        let beta_star = target % m;

        if self.consumed >= self.params.query_budget {
            return Err(PirError::HintExhausted {
                block: alpha_star,
                offset: beta_star,
            });
        }

        let usable: Vec<u64> = self.iprfs[alpha_star as usize]
            .inverse(beta_star)
            .into_iter()
            .filter(|&j| self.hints.is_selectable(j) && self.membership.contains(j, alpha_star))
            .collect();

        let Some(&hint) = usable.choose(&mut self.rng) else {
            return Err(PirError::HintExhausted {
                block: alpha_star,
                offset: beta_star,
            });
        };
        self.hints.reserve(hint);

        let offsets: Vec<u64> = (0..self.params.set_size)
            .map(|alpha| self.iprfs[alpha as usize].forward(hint))
            .collect();
        let p: Vec<u64> = (0..self.params.set_size)
            .filter(|&alpha| alpha != alpha_star && self.membership.contains(hint, alpha))
            .collect();

        Ok((
            QueryRequest { p, offsets },
            PendingQuery {
                target,
                hint,
                block: alpha_star,
            },
        ))
    }

    /// Recombine the server parity with the stored hint parity.
    ///
    /// Consumes the hint, promotes a backup to keep the unused population
    /// from draining, and caches the recovered entry.
    pub fn reconstruct(&mut self, pending: PendingQuery, response_parity: &Entry) -> Entry {
        let mut value = *self.hints.parity(pending.hint);
        xor_entry(&mut value, response_parity);

        self.hints.consume(pending.hint);
        self.consumed += 1;

        // Prefer a backup that already covers the queried cell so the
        // cover invariant degrades as slowly as possible.
        let beta = pending.target % self.params.chunk_size;
        let covering = self.iprfs[pending.block as usize]
            .inverse(beta)
            .into_iter()
            .find(|&j| {
                self.hints.state(j) == HintState::Backup
                    && self.membership.contains(j, pending.block)
            });
        match covering {
            Some(j) => self.hints.promote(j),
            None => {
                self.hints.promote_any();
            }
        }

        self.cache.insert(pending.target, value);
        value
    }

    /// Abort an in-flight query; no client state mutates.
    pub fn cancel(&mut self, pending: PendingQuery) {
        self.hints.release(pending.hint);
    }

    /// Fold one XOR-delta into every hint covering the changed entry.
    /// O(H/m) per update; no cryptographic material changes.
    pub fn apply_delta(&mut self, index: u64, delta: &Entry) {
        assert!(index < self.params.padded_len(), "delta index outside database");

        let m = self.params.chunk_size;
        let alpha = index / m;
        let beta = index % m;

        for j in self.iprfs[alpha as usize].inverse(beta) {
            if self.hints.state(j) != HintState::Consumed && self.membership.contains(j, alpha) {
                self.hints.xor_into(j, delta);
            }
        }
        self.cache.remove(&index);
    }

    /// Apply one block's updates. Heights must arrive monotone
    /// non-decreasing; ordering inside a block is irrelevant since XOR
    /// commutes.
    pub fn apply_delta_batch(&mut self, height: u64, updates: &[(u64, Entry)]) {
        assert!(
            height >= self.delta_height,
            "delta height {} below already-applied {}",
            height,
            self.delta_height
        );
        for (index, delta) in updates {
            self.apply_delta(*index, delta);
        }
        self.delta_height = height;
    }

    /// Whether the hint population calls for a refresh.
    pub fn needs_refresh(&self) -> bool {
        self.consumed >= self.params.query_budget
            || self.hints.unused_count() < self.params.set_size
    }

    /// Rotate the master secret and rebuild every hint from the supplied
    /// snapshot. The caller persists the new secret afterwards.
    pub fn refresh(&mut self, db: &[Entry]) {
        let mut secret = [0u8; 32];
        self.rng.fill_bytes(&mut secret);
        self.rekey(secret);
        self.hint_init(db);
    }

    /// Re-derive all keyed material under a new master secret.
    pub fn rekey(&mut self, master_secret: [u8; 32]) {
        self.iprfs = Self::derive_iprfs(&master_secret, &self.params);
        self.membership = Membership::new(derive_membership_key(&master_secret));
        self.master_secret = master_secret;
    }

    /// Adopt a previously persisted hint table.
    pub fn restore_hints(
        &mut self,
        table: HintTable,
        delta_height: u64,
        consumed: u64,
    ) -> Result<(), PirError> {
        if table.len() != self.params.hint_domain() {
            return Err(PirError::HintCacheIncompatible(format!(
                "table holds {} hints, parameters require {}",
                table.len(),
                self.params.hint_domain()
            )));
        }
        self.hints = table;
        self.delta_height = delta_height;
        self.consumed = consumed;
        self.cache.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::BinomialMode;

    fn tiny_engine() -> (ClientEngine, Vec<Entry>) {
        let params = PirParams::derive(16, 32, 1024, BinomialMode::NormalApprox);
        let db: Vec<Entry> = (0..16)
            .map(|i| {
                let mut e = [0u8; ENTRY_SIZE];
                e[0..8].copy_from_slice(&(i as u64 + 1).to_le_bytes());
                e
            })
            .collect();
        let mut engine =
            ClientEngine::with_rng([0u8; 32], params, ChaCha20Rng::seed_from_u64(42));
        engine.hint_init(&db);
        (engine, db)
    }

    #[test]
    fn query_reserves_and_cancel_releases() {
        let (mut engine, _db) = tiny_engine();

        let (_request, pending) = engine.query(5).unwrap();
        let hint = pending.hint_index();
        assert!(!engine.hints().is_selectable(hint));
        assert_eq!(engine.hints().state(hint), HintState::Unused);

        engine.cancel(pending);
        assert!(engine.hints().is_selectable(hint));
        assert_eq!(engine.consumed_queries(), 0);
    }

    #[test]
    fn query_message_punctures_the_target_block() {
        let (mut engine, _db) = tiny_engine();

        let (request, pending) = engine.query(5).unwrap();
        let alpha_star = 5 / engine.params().chunk_size;
        assert!(!request.p.contains(&alpha_star));
        assert_eq!(request.offsets.len() as u64, engine.params().set_size);
        assert_eq!(request.offsets[alpha_star as usize], 5 % engine.params().chunk_size);
        engine.cancel(pending);
    }

    #[test]
    fn budget_exhaustion_reports_hint_exhausted() {
        let params = PirParams::derive(16, 32, 0, BinomialMode::NormalApprox);
        let mut engine =
            ClientEngine::with_rng([1u8; 32], params, ChaCha20Rng::seed_from_u64(7));
        engine.hint_init(&[[0u8; ENTRY_SIZE]; 16]);
        assert!(matches!(engine.query(3), Err(PirError::HintExhausted { .. })));
    }

    #[test]
    fn delta_invalidates_cached_entry() {
        let (mut engine, db) = tiny_engine();

        // Simulate a full round trip against an in-memory fold.
        let (request, pending) = engine.query(5).unwrap();
        let m = engine.params().chunk_size;
        let mut response = [0u8; ENTRY_SIZE];
        for &alpha in &request.p {
            let idx = (alpha * m + request.offsets[alpha as usize]) as usize;
            if idx < db.len() {
                xor_entry(&mut response, &db[idx]);
            }
        }
        let value = engine.reconstruct(pending, &response);
        assert_eq!(u64::from_le_bytes(value[0..8].try_into().unwrap()), 6);
        assert!(engine.cached(5).is_some());

        let mut delta = [0u8; ENTRY_SIZE];
        delta[0] = 0x07;
        engine.apply_delta(5, &delta);
        assert!(engine.cached(5).is_none());
    }

    #[test]
    fn rekey_changes_the_hint_layout() {
        let (mut engine, db) = tiny_engine();
        let before = engine.hints().parity_bytes().to_vec();

        engine.rekey([9u8; 32]);
        engine.hint_init(&db);
        assert_ne!(engine.hints().parity_bytes(), &before[..]);
    }
}
