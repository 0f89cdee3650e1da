//! Plinko parameter derivation and key schedule.
//!
//! Geometry `(chunk_size, set_size)` is derived deterministically from the
//! unpadded entry count and must match between server and client; the
//! per-block iPRF keys and the hint-set membership key are derived from the
//! client's 32-byte master secret with SHA-256.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Width of one database entry in bytes (256-bit words).
pub const ENTRY_SIZE: usize = 32;

/// One database entry / parity word.
pub type Entry = [u8; ENTRY_SIZE];

/// Domain-separation label for per-block iPRF key derivation.
pub const IPRF_KEY_LABEL: &[u8] = b"iprf-key-derivation-v1";

/// Domain-separation label for the hint-set membership key.
pub const MEMBERSHIP_KEY_LABEL: &[u8] = b"hint-membership-v1";

/// XOR `src` into `acc` word-wise.
#[inline]
pub fn xor_entry(acc: &mut Entry, src: &Entry) {
    for (a, s) in acc.iter_mut().zip(src.iter()) {
        *a ^= s;
    }
}

/// Which binomial sampler backs the PMNS tree.
///
/// The two modes produce different hint tables even under identical keys,
/// so the active mode is recorded in the snapshot manifest and the hint
/// cache header and tables from different modes are never mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinomialMode {
    /// Exact Bernoulli bit-counting from an AES-CTR keystream.
    Exact,
    /// Box-Muller normal approximation above `C_SMALL` balls.
    NormalApprox,
}

impl Default for BinomialMode {
    fn default() -> Self {
        BinomialMode::NormalApprox
    }
}

impl fmt::Display for BinomialMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinomialMode::Exact => write!(f, "exact"),
            BinomialMode::NormalApprox => write!(f, "normal_approx"),
        }
    }
}

impl FromStr for BinomialMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(BinomialMode::Exact),
            "normal_approx" | "normal-approx" => Ok(BinomialMode::NormalApprox),
            other => Err(format!("unknown binomial mode: {other}")),
        }
    }
}

/// Complete client/server parameter set for one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PirParams {
    /// Unpadded entry count of the canonical database.
    pub n_raw: u64,
    /// Entries per block (`m`), a power of two.
    pub chunk_size: u64,
    /// Number of blocks (`k`), a multiple of 4.
    pub set_size: u64,
    /// Security parameter; also the regular/backup hint multiplier.
    pub lambda: u64,
    /// Hard limit on consumed hints before a refresh is required.
    pub query_budget: u64,
    /// Active binomial sampler variant.
    pub binomial_mode: BinomialMode,
}

impl PirParams {
    /// Derive the full parameter set from the unpadded entry count.
    pub fn derive(n_raw: u64, lambda: u64, query_budget: u64, binomial_mode: BinomialMode) -> Self {
        let (chunk_size, set_size) = derive_geometry(n_raw);
        Self {
            n_raw,
            chunk_size,
            set_size,
            lambda,
            query_budget,
            binomial_mode,
        }
    }

    /// Regular (initially `Unused`) hint count.
    pub fn num_hints(&self) -> u64 {
        self.lambda * self.set_size
    }

    /// Spare hints reserved as `Backup` at init time.
    pub fn backup_hints(&self) -> u64 {
        self.lambda * self.set_size
    }

    /// iPRF domain: regular plus backup hints.
    pub fn hint_domain(&self) -> u64 {
        self.num_hints() + self.backup_hints()
    }

    /// Database length after zero-padding to `chunk_size * set_size`.
    pub fn padded_len(&self) -> u64 {
        self.chunk_size * self.set_size
    }
}

/// Derive `(chunk_size, set_size)` from the unpadded entry count.
///
/// `chunk_size` is the least power of two at or above `2 * ceil(sqrt(n))`;
/// `set_size` is `n / chunk_size` rounded up to a multiple of 4 (never
/// below 4). Integer division here reproduces the reference derivation
/// table, including `5_607_168 -> (8192, 684)`.
pub fn derive_geometry(n_raw: u64) -> (u64, u64) {
    assert!(n_raw >= 1, "database must hold at least one entry");

    let mut root = (n_raw as f64).sqrt() as u64;
    while root * root < n_raw {
        root += 1;
    }

    let chunk_size = (2 * root).next_power_of_two();
    let set_size = ((n_raw / chunk_size + 3) / 4 * 4).max(4);
    (chunk_size, set_size)
}

/// Per-block iPRF key: `SHA256(master || label || u64_be(block))`.
pub fn derive_block_key(master_secret: &[u8; 32], block: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master_secret);
    hasher.update(IPRF_KEY_LABEL);
    hasher.update(block.to_be_bytes());
    let digest = hasher.finalize();

    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

/// Client-private key for the `in_P(j, alpha)` membership bit.
pub fn derive_membership_key(master_secret: &[u8; 32]) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(master_secret);
    hasher.update(MEMBERSHIP_KEY_LABEL);
    let digest = hasher.finalize();

    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[0..16]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_table() {
        // Reference vectors from the protocol documentation.
        assert_eq!(derive_geometry(16), (8, 4));
        assert_eq!(derive_geometry(10), (8, 4));
        assert_eq!(derive_geometry(23), (16, 4));
        assert_eq!(derive_geometry(8_388_608), (8192, 1024));
        assert_eq!(derive_geometry(5_607_168), (8192, 684));
    }

    #[test]
    fn chunk_is_power_of_two_and_set_is_multiple_of_four() {
        for n in [1u64, 2, 3, 7, 100, 1023, 4096, 99_999] {
            let (chunk, set) = derive_geometry(n);
            assert!(chunk.is_power_of_two(), "chunk {} for n={}", chunk, n);
            assert_eq!(set % 4, 0, "set {} for n={}", set, n);
            assert!(set >= 4);
        }
    }

    #[test]
    fn block_keys_are_distinct_and_stable() {
        let master = [7u8; 32];
        let k0 = derive_block_key(&master, 0);
        let k1 = derive_block_key(&master, 1);
        assert_ne!(k0, k1);
        assert_eq!(k0, derive_block_key(&master, 0));
        assert_ne!(&k0[0..16], &derive_membership_key(&master)[..]);
    }

    #[test]
    fn binomial_mode_round_trips_through_str() {
        for mode in [BinomialMode::Exact, BinomialMode::NormalApprox] {
            assert_eq!(mode.to_string().parse::<BinomialMode>().unwrap(), mode);
        }
        assert!("gaussian".parse::<BinomialMode>().is_err());
    }
}
