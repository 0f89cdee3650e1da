//! Invertible PRF: small-domain PRP composed with the multinomial sampler.
//!
//! `forward(x) = pmns.forward(prp.forward(x))`; the inverse enumerates the
//! bin's ranks and pulls each back through the PRP. Forward is O(log m),
//! inverse is O(log m + preimages).

use crate::params::BinomialMode;
use crate::pmns::Pmns;
use crate::prp::FeistelPrp;

pub type IprfKey = [u8; 32];

pub struct Iprf {
    prp: FeistelPrp,
    pmns: Pmns,
}

impl Iprf {
    /// Split the 32-byte key into PRP and PMNS halves and instantiate both.
    pub fn new(key: IprfKey, domain: u64, range: u64, mode: BinomialMode) -> Self {
        let mut prp_key = [0u8; 16];
        prp_key.copy_from_slice(&key[0..16]);
        let mut pmns_key = [0u8; 16];
        pmns_key.copy_from_slice(&key[16..32]);

        Self {
            prp: FeistelPrp::new(prp_key, domain),
            pmns: Pmns::new(pmns_key, domain, range, mode),
        }
    }

    pub fn domain(&self) -> u64 {
        self.prp.domain()
    }

    pub fn range(&self) -> u64 {
        self.pmns.range()
    }

    pub fn forward(&self, x: u64) -> u64 {
        self.pmns.forward(self.prp.forward(x))
    }

    /// Every `x` with `forward(x) = y`, in permuted-rank order.
    pub fn inverse(&self, y: u64) -> Vec<u64> {
        self.pmns
            .inverse(y)
            .into_iter()
            .map(|rank| self.prp.inverse(rank))
            .collect()
    }
}
