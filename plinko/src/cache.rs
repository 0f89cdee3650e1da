//! Hint-table persistence.
//!
//! The cache is a bincode blob: a header binding the table to the hint
//! format version, sampler mode, snapshot, and master key, followed by the
//! raw parity buffer and state codes, sealed with a blake3 checksum. Any
//! mismatch surfaces as `HintCacheIncompatible`, which callers treat as
//! "regenerate silently".

use serde::{Deserialize, Serialize};

use crate::error::PirError;
use crate::hint::{HintState, HintTable};
use crate::params::BinomialMode;

/// Bump to invalidate every previously written hint cache.
pub const HINT_FORMAT_VERSION: u32 = 1;

/// Identity a cache blob is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub format_version: u32,
    pub binomial_mode: BinomialMode,
    pub snapshot_hash_prefix: [u8; 8],
    pub master_key_hash_prefix: [u8; 8],
}

impl CacheKey {
    pub fn new(
        format_version: u32,
        binomial_mode: BinomialMode,
        snapshot_sha256: &[u8; 32],
        master_secret: &[u8; 32],
    ) -> Self {
        let master_digest = blake3::hash(master_secret);
        Self {
            format_version,
            binomial_mode,
            snapshot_hash_prefix: snapshot_sha256[0..8].try_into().unwrap(),
            master_key_hash_prefix: master_digest.as_bytes()[0..8].try_into().unwrap(),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheBlob {
    key: CacheKey,
    delta_height: u64,
    consumed: u64,
    states: Vec<u8>,
    parities: Vec<u8>,
    checksum: [u8; 32],
}

fn payload_checksum(key: &CacheKey, delta_height: u64, consumed: u64, states: &[u8], parities: &[u8]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&key.format_version.to_le_bytes());
    hasher.update(&[match key.binomial_mode {
        BinomialMode::Exact => 0u8,
        BinomialMode::NormalApprox => 1u8,
    }]);
    hasher.update(&key.snapshot_hash_prefix);
    hasher.update(&key.master_key_hash_prefix);
    hasher.update(&delta_height.to_le_bytes());
    hasher.update(&consumed.to_le_bytes());
    hasher.update(states);
    hasher.update(parities);
    *hasher.finalize().as_bytes()
}

/// Serialize a hint table with its binding header.
pub fn encode_hint_cache(
    key: &CacheKey,
    table: &HintTable,
    delta_height: u64,
    consumed: u64,
) -> Vec<u8> {
    let states: Vec<u8> = table.states().iter().map(|s| s.code()).collect();
    let parities = table.parity_bytes().to_vec();
    let checksum = payload_checksum(key, delta_height, consumed, &states, &parities);

    bincode::serialize(&CacheBlob {
        key: *key,
        delta_height,
        consumed,
        states,
        parities,
        checksum,
    })
    .expect("hint cache serialization cannot fail")
}

/// Decode and validate a cache blob against the expected identity.
///
/// Returns the restored table plus `(delta_height, consumed)`.
pub fn decode_hint_cache(
    bytes: &[u8],
    expected: &CacheKey,
) -> Result<(HintTable, u64, u64), PirError> {
    let blob: CacheBlob = bincode::deserialize(bytes)
        .map_err(|e| PirError::HintCacheIncompatible(format!("undecodable cache: {e}")))?;

    if blob.key != *expected {
        return Err(PirError::HintCacheIncompatible(format!(
            "cache bound to {:?}, expected {:?}",
            blob.key, expected
        )));
    }

    let checksum = payload_checksum(
        &blob.key,
        blob.delta_height,
        blob.consumed,
        &blob.states,
        &blob.parities,
    );
    if checksum != blob.checksum {
        return Err(PirError::HintCacheIncompatible("checksum mismatch".into()));
    }

    let states = blob
        .states
        .iter()
        .map(|&code| HintState::from_code(code))
        .collect::<Result<Vec<_>, _>>()?;
    let table = HintTable::from_parts(blob.parities, states)?;
    Ok((table, blob.delta_height, blob.consumed))
}
