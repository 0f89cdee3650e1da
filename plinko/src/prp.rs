//! Small-domain pseudorandom permutation.
//!
//! A 4-round balanced Feistel network over the smallest even bit width `b`
//! with `2^b >= N`, made bijective on `[0, N)` by cycle-walking across the
//! rejection region `[N, 2^b)`. The round function truncates an AES block
//! keyed by the PRP key. Inversion runs the rounds in reverse, so both
//! directions are O(1) AES work (expected cycle-walk length `2^b / N <= 2`).

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

pub type PrpKey = [u8; 16];

const FEISTEL_ROUNDS: u64 = 4;

pub struct FeistelPrp {
    cipher: Aes128,
    domain: u64,
    half_bits: u32,
    half_mask: u64,
}

impl FeistelPrp {
    pub fn new(key: PrpKey, domain: u64) -> Self {
        assert!(domain >= 1, "PRP domain must be non-empty");

        // Smallest even width b with 2^b >= domain; each Feistel half gets b/2 bits.
        let mut bits = 64 - domain.saturating_sub(1).leading_zeros();
        if bits < 2 {
            bits = 2;
        }
        if bits % 2 == 1 {
            bits += 1;
        }
        let half_bits = bits / 2;

        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
            domain,
            half_bits,
            half_mask: (1u64 << half_bits) - 1,
        }
    }

    pub fn domain(&self) -> u64 {
        self.domain
    }

    /// Round function: low `half_bits` of `AES_K(round || r)`.
    fn round_fn(&self, round: u64, r: u64) -> u64 {
        let mut input = [0u8; 16];
        input[0..8].copy_from_slice(&round.to_be_bytes());
        input[8..16].copy_from_slice(&r.to_be_bytes());

        let mut block = GenericArray::from(input);
        self.cipher.encrypt_block(&mut block);

        u64::from_be_bytes(block[0..8].try_into().unwrap()) & self.half_mask
    }

    /// One pass of the Feistel network over `[0, 2^b)`.
    fn permute(&self, v: u64) -> u64 {
        let mut left = v >> self.half_bits;
        let mut right = v & self.half_mask;

        for round in 0..FEISTEL_ROUNDS {
            let next = left ^ self.round_fn(round, right);
            left = right;
            right = next;
        }
        (left << self.half_bits) | right
    }

    /// Inverse Feistel pass: rounds in reverse order.
    fn permute_inv(&self, v: u64) -> u64 {
        let mut left = v >> self.half_bits;
        let mut right = v & self.half_mask;

        for round in (0..FEISTEL_ROUNDS).rev() {
            let prev = right ^ self.round_fn(round, left);
            right = left;
            left = prev;
        }
        (left << self.half_bits) | right
    }

    /// Forward permutation on `[0, domain)`.
    ///
    /// `x >= domain` violates the caller contract.
    pub fn forward(&self, x: u64) -> u64 {
        assert!(x < self.domain, "PRP input {} outside domain {}", x, self.domain);

        // Walk the permutation cycle until the image lands inside the domain.
        // Termination: the cycle through x returns to x, which is < domain.
        let mut y = self.permute(x);
        while y >= self.domain {
            y = self.permute(y);
        }
        y
    }

    /// Inverse permutation on `[0, domain)`.
    pub fn inverse(&self, y: u64) -> u64 {
        assert!(y < self.domain, "PRP input {} outside domain {}", y, self.domain);

        let mut x = self.permute_inv(y);
        while x >= self.domain {
            x = self.permute_inv(x);
        }
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn forward_is_a_bijection() {
        for domain in [1u64, 2, 5, 16, 100, 1000, 1 << 12] {
            let prp = FeistelPrp::new([3u8; 16], domain);
            let mut outputs: Vec<u64> = (0..domain).map(|x| prp.forward(x)).collect();
            outputs.sort_unstable();
            outputs.dedup();
            assert_eq!(outputs.len() as u64, domain, "not a permutation at N={}", domain);
            assert_eq!(*outputs.last().unwrap(), domain - 1);
        }
    }

    #[test]
    fn inverse_undoes_forward() {
        let prp = FeistelPrp::new([9u8; 16], 1000);
        for x in 0..1000 {
            assert_eq!(prp.inverse(prp.forward(x)), x);
        }
    }

    #[test]
    fn non_power_of_two_domain_cycle_walks() {
        // 2^b = 1024 for domain 777, so roughly a quarter of Feistel
        // outputs fall in the rejection region and must be walked past.
        let prp = FeistelPrp::new([0u8; 16], 777);
        for x in 0..777 {
            let y = prp.forward(x);
            assert!(y < 777);
            assert_eq!(prp.inverse(y), x);
        }
    }

    #[test]
    fn distinct_keys_give_distinct_permutations() {
        let a = FeistelPrp::new([1u8; 16], 4096);
        let b = FeistelPrp::new([2u8; 16], 4096);
        let same = (0..4096).filter(|&x| a.forward(x) == b.forward(x)).count();
        // A pair of random permutations agrees on ~1 point in expectation.
        assert!(same < 32, "keys barely affect the permutation: {} fixed points", same);
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_keys(key in any::<[u8; 16]>(),
                                               domain in 1u64..10_000,
                                               seed in any::<u64>()) {
            let prp = FeistelPrp::new(key, domain);
            let x = seed % domain;
            prop_assert_eq!(prp.inverse(prp.forward(x)), x);
        }
    }
}
