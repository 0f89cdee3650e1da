//! Pseudorandom multinomial sampler.
//!
//! Distributes `N` ranks across `M` bins by descending a binary tree over
//! the bin range. Each internal node covering bins `[lo, hi]` with `count`
//! balls splits them with an exact draw from
//! `Binomial(count, left_bins / total_bins)` keyed by the node identifier
//! `SHA256(lo || hi || N_root)`. The identifier hashes the root domain
//! size, never the subtree count; keying nodes by the subtree count makes
//! forward and inverse disagree once counts repeat across levels.
//!
//! Forward descent follows the rank, inverse descent follows the bin; a
//! leaf holds the contiguous rank range `[start, start + count)`.

use sha2::{Digest, Sha256};

use crate::binomial::BinomialSampler;
use crate::params::BinomialMode;

pub struct Pmns {
    sampler: BinomialSampler,
    domain: u64,
    range: u64,
}

/// Tree-node identifier: `SHA256(lo || hi || root_n)` truncated to 64 bits.
fn node_id(lo: u64, hi: u64, root_n: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(lo.to_be_bytes());
    hasher.update(hi.to_be_bytes());
    hasher.update(root_n.to_be_bytes());
    let digest = hasher.finalize();
    u64::from_be_bytes(digest[0..8].try_into().unwrap())
}

impl Pmns {
    pub fn new(key: [u8; 16], domain: u64, range: u64, mode: BinomialMode) -> Self {
        assert!(range >= 1, "PMNS needs at least one bin");
        Self {
            sampler: BinomialSampler::new(key, mode),
            domain,
            range,
        }
    }

    pub fn domain(&self) -> u64 {
        self.domain
    }

    pub fn range(&self) -> u64 {
        self.range
    }

    /// Bin containing rank `x`. O(log M).
    pub fn forward(&self, x: u64) -> u64 {
        assert!(x < self.domain, "rank {} outside domain {}", x, self.domain);

        let mut lo = 0u64;
        let mut hi = self.range - 1;
        let mut count = self.domain;
        let mut rank = x;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let left_bins = mid - lo + 1;
            let total_bins = hi - lo + 1;

            let node = node_id(lo, hi, self.domain);
            let left = self.sampler.sample(node, count, left_bins, total_bins);

            if rank < left {
                hi = mid;
                count = left;
            } else {
                lo = mid + 1;
                rank -= left;
                count -= left;
            }
        }
        lo
    }

    /// All ranks landing in bin `y`, ascending. O(log M + |bin|).
    pub fn inverse(&self, y: u64) -> Vec<u64> {
        assert!(y < self.range, "bin {} outside range {}", y, self.range);

        let (start, count) = self.bin_bounds(y);
        (start..start + count).collect()
    }

    /// `(start, count)` of the contiguous rank range held by bin `y`.
    pub fn bin_bounds(&self, y: u64) -> (u64, u64) {
        assert!(y < self.range, "bin {} outside range {}", y, self.range);

        let mut lo = 0u64;
        let mut hi = self.range - 1;
        let mut count = self.domain;
        let mut start = 0u64;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let left_bins = mid - lo + 1;
            let total_bins = hi - lo + 1;

            let node = node_id(lo, hi, self.domain);
            let left = self.sampler.sample(node, count, left_bins, total_bins);

            if y <= mid {
                hi = mid;
                count = left;
            } else {
                lo = mid + 1;
                start += left;
                count -= left;
            }
        }
        (start, count)
    }
}
