//! Deterministic binomial sampling for the PMNS tree.
//!
//! Every tree node needs an exact draw from `Binomial(count, num/denom)`
//! that is a pure function of `(key, node_id, count)`. Two variants are
//! provided behind one interface, selected by [`BinomialMode`]:
//!
//! - [`ExactSampler`]: counts successes among `count` Bernoulli trials fed
//!   by an AES-CTR keystream whose nonce is the node identifier. Exact, but
//!   O(count) per draw.
//! - [`NormalApproxSampler`]: one AES block under the node identifier
//!   yields two uniforms, Box-Muller produces a normal deviate, and the
//!   draw is `round(c*p + sqrt(c*p*(1-p))*z)` clamped to `[0, c]`. O(1),
//!   used above [`C_SMALL`] balls; small counts fall back to the exact
//!   sampler.
//!
//! The two variants produce different numerical outputs, so hint tables
//! generated under one mode never mix with the other.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;

use crate::params::BinomialMode;

type Keystream = ctr::Ctr128BE<Aes128>;

/// Ball-count threshold below which the normal approximation is not used.
pub const C_SMALL: u64 = 100;

const INV_TWO_TO_53: f64 = 1.0 / (1u64 << 53) as f64;

/// Exact Bernoulli bit-counting sampler.
pub struct ExactSampler {
    key: [u8; 16],
}

impl ExactSampler {
    pub fn new(key: [u8; 16]) -> Self {
        Self { key }
    }

    /// Draw from `Binomial(count, num/denom)`, deterministic in
    /// `(key, node_id, count)`.
    pub fn sample(&self, node_id: u64, count: u64, num: u64, denom: u64) -> u64 {
        if count == 0 || num == 0 || denom == 0 {
            return 0;
        }
        if num >= denom {
            return count;
        }

        // Success iff a 64-bit keystream word falls under floor(p * 2^64);
        // the rational threshold keeps the trial exact to within 2^-64.
        let threshold = ((num as u128) << 64) / denom as u128;

        let mut iv = [0u8; 16];
        iv[8..16].copy_from_slice(&node_id.to_be_bytes());
        let mut stream = Keystream::new(&self.key.into(), &iv.into());

        let mut buf = [0u8; 512];
        let mut used = buf.len();
        let mut successes = 0u64;

        for _ in 0..count {
            if used == buf.len() {
                buf = [0u8; 512];
                stream.apply_keystream(&mut buf);
                used = 0;
            }
            let word = u64::from_be_bytes(buf[used..used + 8].try_into().unwrap());
            used += 8;
            if (word as u128) < threshold {
                successes += 1;
            }
        }
        successes
    }
}

/// Box-Muller normal-approximation sampler with exact fallback.
pub struct NormalApproxSampler {
    cipher: Aes128,
    exact: ExactSampler,
}

impl NormalApproxSampler {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
            exact: ExactSampler::new(key),
        }
    }

    pub fn sample(&self, node_id: u64, count: u64, num: u64, denom: u64) -> u64 {
        if count <= C_SMALL {
            return self.exact.sample(node_id, count, num, denom);
        }
        if num == 0 || denom == 0 {
            return 0;
        }
        if num >= denom {
            return count;
        }

        let p = num as f64 / denom as f64;

        // One AES block yields both uniforms for Box-Muller.
        let mut input = [0u8; 16];
        input[8..16].copy_from_slice(&node_id.to_be_bytes());
        let mut block = GenericArray::from(input);
        self.cipher.encrypt_block(&mut block);

        let w1 = u64::from_be_bytes(block[0..8].try_into().unwrap());
        let w2 = u64::from_be_bytes(block[8..16].try_into().unwrap());

        // Map to (0, 1); the half-step offset keeps u1 away from zero.
        let u1 = ((w1 >> 11) as f64 + 0.5) * INV_TWO_TO_53;
        let u2 = ((w2 >> 11) as f64 + 0.5) * INV_TWO_TO_53;

        let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();

        let mean = count as f64 * p;
        let stddev = (count as f64 * p * (1.0 - p)).sqrt();
        let drawn = (mean + stddev * z).round();

        if drawn <= 0.0 {
            0
        } else if drawn >= count as f64 {
            count
        } else {
            drawn as u64
        }
    }
}

/// Mode-selected sampler used by the PMNS tree.
pub enum BinomialSampler {
    Exact(ExactSampler),
    NormalApprox(NormalApproxSampler),
}

impl BinomialSampler {
    pub fn new(key: [u8; 16], mode: BinomialMode) -> Self {
        match mode {
            BinomialMode::Exact => BinomialSampler::Exact(ExactSampler::new(key)),
            BinomialMode::NormalApprox => {
                BinomialSampler::NormalApprox(NormalApproxSampler::new(key))
            }
        }
    }

    #[inline]
    pub fn sample(&self, node_id: u64, count: u64, num: u64, denom: u64) -> u64 {
        match self {
            BinomialSampler::Exact(s) => s.sample(node_id, count, num, denom),
            BinomialSampler::NormalApprox(s) => s.sample(node_id, count, num, denom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draws_stay_in_range() {
        let exact = ExactSampler::new([1u8; 16]);
        let approx = NormalApproxSampler::new([1u8; 16]);

        for node in 0..200u64 {
            for count in [0u64, 1, 7, 100, 101, 5000] {
                for (num, denom) in [(1u64, 2u64), (1, 4), (3, 4), (5, 8)] {
                    assert!(exact.sample(node, count, num, denom) <= count);
                    assert!(approx.sample(node, count, num, denom) <= count);
                }
            }
        }
    }

    #[test]
    fn degenerate_probabilities() {
        let exact = ExactSampler::new([2u8; 16]);
        assert_eq!(exact.sample(17, 50, 0, 2), 0);
        assert_eq!(exact.sample(17, 50, 2, 2), 50);
        assert_eq!(exact.sample(17, 0, 1, 2), 0);
    }

    #[test]
    fn draws_are_deterministic_in_node_and_count() {
        let a = ExactSampler::new([5u8; 16]);
        let b = ExactSampler::new([5u8; 16]);
        for node in 0..50u64 {
            assert_eq!(a.sample(node, 64, 1, 2), b.sample(node, 64, 1, 2));
        }
    }

    #[test]
    fn exact_sampler_mean_tracks_probability() {
        let sampler = ExactSampler::new([8u8; 16]);
        let trials = 500u64;
        let count = 80u64;

        let sum: u64 = (0..trials).map(|node| sampler.sample(node, count, 1, 4)).sum();
        let mean = sum as f64 / trials as f64;
        // Binomial(80, 0.25): mean 20, sd of the sample mean ~0.17.
        assert!((mean - 20.0).abs() < 1.5, "mean {} off target 20", mean);
    }

    #[test]
    fn normal_approx_mean_tracks_probability() {
        let sampler = NormalApproxSampler::new([8u8; 16]);
        let trials = 500u64;
        let count = 10_000u64;

        let sum: u64 = (0..trials).map(|node| sampler.sample(node, count, 1, 2)).sum();
        let mean = sum as f64 / trials as f64;
        // Binomial(10_000, 0.5): mean 5000, sd of the sample mean ~2.2.
        assert!((mean - 5000.0).abs() < 25.0, "mean {} off target 5000", mean);
    }

    #[test]
    fn small_counts_match_exact_under_both_modes() {
        let exact = BinomialSampler::new([4u8; 16], BinomialMode::Exact);
        let approx = BinomialSampler::new([4u8; 16], BinomialMode::NormalApprox);

        for node in 0..100u64 {
            for count in [0u64, 1, 10, C_SMALL] {
                assert_eq!(
                    exact.sample(node, count, 1, 2),
                    approx.sample(node, count, 1, 2),
                    "divergence at node {} count {}",
                    node,
                    count
                );
            }
        }
    }
}
