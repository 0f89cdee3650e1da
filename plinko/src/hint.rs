//! Client hint table and hint-set membership.
//!
//! The table is a single contiguous parity buffer plus a parallel state
//! array, which keeps the XOR passes of hint generation and delta
//! application cache-friendly. Membership of block `alpha` in a hint's set
//! `P_j` is a keyed pseudorandom bit computed on demand; it is never stored
//! and never leaves the client.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::PirError;
use crate::params::{xor_entry, Entry, ENTRY_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintState {
    Unused,
    Consumed,
    Backup,
}

impl HintState {
    pub fn code(self) -> u8 {
        match self {
            HintState::Unused => 0,
            HintState::Consumed => 1,
            HintState::Backup => 2,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, PirError> {
        match code {
            0 => Ok(HintState::Unused),
            1 => Ok(HintState::Consumed),
            2 => Ok(HintState::Backup),
            other => Err(PirError::HintCacheIncompatible(format!(
                "unknown hint state code {other}"
            ))),
        }
    }
}

/// Keyed derivation of the `in_P(j, alpha)` bit.
pub struct Membership {
    cipher: Aes128,
}

impl Membership {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
        }
    }

    /// Whether block `alpha` belongs to hint `j`'s set `P_j`.
    #[inline]
    pub fn contains(&self, hint: u64, block: u64) -> bool {
        let mut input = [0u8; 16];
        input[0..8].copy_from_slice(&hint.to_be_bytes());
        input[8..16].copy_from_slice(&block.to_be_bytes());

        let mut buf = GenericArray::from(input);
        self.cipher.encrypt_block(&mut buf);
        buf[0] & 1 == 1
    }
}

/// Arena of hint parities with parallel per-hint state.
pub struct HintTable {
    parities: Vec<u8>,
    states: Vec<HintState>,
    reserved: Vec<u64>,
    unused: u64,
    backups: u64,
    backup_cursor: u64,
}

impl HintTable {
    /// Fresh all-zero table: `num_hints` records start `Unused`, the
    /// trailing `backup_hints` start `Backup`.
    pub fn new(num_hints: u64, backup_hints: u64) -> Self {
        let total = (num_hints + backup_hints) as usize;
        let mut states = vec![HintState::Unused; total];
        for state in states.iter_mut().skip(num_hints as usize) {
            *state = HintState::Backup;
        }

        Self {
            parities: vec![0u8; total * ENTRY_SIZE],
            states,
            reserved: Vec::new(),
            unused: num_hints,
            backups: backup_hints,
            backup_cursor: num_hints,
        }
    }

    /// Fresh table adopting parities accumulated by hint generation.
    pub fn with_parities(num_hints: u64, backup_hints: u64, parities: Vec<u8>) -> Self {
        let mut table = Self::new(num_hints, backup_hints);
        assert_eq!(parities.len(), table.parities.len(), "parity buffer size mismatch");
        table.parities = parities;
        table
    }

    /// Rebuild a table from persisted parts, recomputing the population
    /// counters from the state array.
    pub fn from_parts(parities: Vec<u8>, states: Vec<HintState>) -> Result<Self, PirError> {
        if parities.len() != states.len() * ENTRY_SIZE {
            return Err(PirError::HintCacheIncompatible(format!(
                "parity buffer {} bytes does not match {} states",
                parities.len(),
                states.len()
            )));
        }

        let unused = states.iter().filter(|s| **s == HintState::Unused).count() as u64;
        let backups = states.iter().filter(|s| **s == HintState::Backup).count() as u64;

        Ok(Self {
            parities,
            states,
            reserved: Vec::new(),
            unused,
            backups,
            backup_cursor: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.states.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn unused_count(&self) -> u64 {
        self.unused
    }

    pub fn backup_count(&self) -> u64 {
        self.backups
    }

    pub fn state(&self, hint: u64) -> HintState {
        self.states[hint as usize]
    }

    pub fn parity(&self, hint: u64) -> &Entry {
        let offset = hint as usize * ENTRY_SIZE;
        self.parities[offset..offset + ENTRY_SIZE].try_into().unwrap()
    }

    pub fn xor_into(&mut self, hint: u64, delta: &Entry) {
        let offset = hint as usize * ENTRY_SIZE;
        let slot: &mut Entry = (&mut self.parities[offset..offset + ENTRY_SIZE])
            .try_into()
            .unwrap();
        xor_entry(slot, delta);
    }

    /// Selectable for a fresh query: `Unused` and not reserved in-flight.
    pub fn is_selectable(&self, hint: u64) -> bool {
        self.states[hint as usize] == HintState::Unused && !self.reserved.contains(&hint)
    }

    /// Pin a hint to an in-flight query so concurrent selection skips it.
    pub fn reserve(&mut self, hint: u64) {
        debug_assert!(self.is_selectable(hint));
        self.reserved.push(hint);
    }

    /// Release a reservation without consuming (cancelled query).
    pub fn release(&mut self, hint: u64) {
        self.reserved.retain(|&j| j != hint);
    }

    /// `Unused -> Consumed`; the hint never answers another query.
    pub fn consume(&mut self, hint: u64) {
        debug_assert_eq!(self.states[hint as usize], HintState::Unused);
        self.release(hint);
        self.states[hint as usize] = HintState::Consumed;
        self.unused -= 1;
    }

    /// `Backup -> Unused` for a specific hint.
    pub fn promote(&mut self, hint: u64) {
        debug_assert_eq!(self.states[hint as usize], HintState::Backup);
        self.states[hint as usize] = HintState::Unused;
        self.backups -= 1;
        self.unused += 1;
    }

    /// Promote the next backup in scan order, if any remain.
    pub fn promote_any(&mut self) -> Option<u64> {
        if self.backups == 0 {
            return None;
        }
        let total = self.len();
        for step in 0..total {
            let j = (self.backup_cursor + step) % total;
            if self.states[j as usize] == HintState::Backup {
                self.promote(j);
                self.backup_cursor = (j + 1) % total;
                return Some(j);
            }
        }
        None
    }

    pub fn parity_bytes(&self) -> &[u8] {
        &self.parities
    }

    pub fn states(&self) -> &[HintState] {
        &self.states
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_is_deterministic_and_balanced() {
        let membership = Membership::new([3u8; 16]);
        let again = Membership::new([3u8; 16]);

        let mut ones = 0u64;
        for j in 0..64 {
            for alpha in 0..64 {
                let bit = membership.contains(j, alpha);
                assert_eq!(bit, again.contains(j, alpha));
                ones += bit as u64;
            }
        }
        // 4096 Bernoulli(1/2) bits: expect ~2048, allow a wide band.
        assert!((1700..=2400).contains(&ones), "membership bias: {} ones", ones);
    }

    #[test]
    fn lifecycle_counters_track_states() {
        let mut table = HintTable::new(4, 2);
        assert_eq!(table.len(), 6);
        assert_eq!(table.unused_count(), 4);
        assert_eq!(table.backup_count(), 2);
        assert_eq!(table.state(5), HintState::Backup);

        table.reserve(1);
        assert!(!table.is_selectable(1));
        table.release(1);
        assert!(table.is_selectable(1));

        table.reserve(1);
        table.consume(1);
        assert_eq!(table.state(1), HintState::Consumed);
        assert_eq!(table.unused_count(), 3);

        let promoted = table.promote_any().unwrap();
        assert_eq!(table.state(promoted), HintState::Unused);
        assert_eq!(table.backup_count(), 1);
        assert_eq!(table.unused_count(), 4);
    }

    #[test]
    fn xor_is_involutive() {
        let mut table = HintTable::new(2, 0);
        let mut delta: Entry = [0u8; ENTRY_SIZE];
        delta[0] = 0xAB;
        delta[31] = 0x5C;

        table.xor_into(0, &delta);
        assert_eq!(table.parity(0)[0], 0xAB);
        table.xor_into(0, &delta);
        assert_eq!(table.parity(0), &[0u8; ENTRY_SIZE]);
        assert_eq!(table.parity(1), &[0u8; ENTRY_SIZE]);
    }

    #[test]
    fn from_parts_restores_counts() {
        let mut table = HintTable::new(3, 1);
        table.consume(0);
        let restored =
            HintTable::from_parts(table.parity_bytes().to_vec(), table.states().to_vec()).unwrap();
        assert_eq!(restored.unused_count(), 2);
        assert_eq!(restored.backup_count(), 1);
    }
}
