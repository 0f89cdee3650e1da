//! Server-side database: a read-only array of 32-byte words with the XOR
//! fold primitives behind every query type.
//!
//! `database.bin` is memory-mapped and logically zero-padded up to
//! `chunk_size * set_size`; the padding never exists on disk, lookups past
//! the file simply produce the zero word. All folds are straight XOR
//! passes with no branching on entry contents.

use std::fs::File;
use std::path::Path;

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use memmap2::Mmap;

use crate::error::PirError;
use crate::params::{derive_geometry, xor_entry, Entry, ENTRY_SIZE};
use crate::wire::QueryRequest;

enum Backing {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Owned(vec) => vec,
        }
    }
}

pub struct Database {
    backing: Backing,
    n_raw: u64,
    chunk_size: u64,
    set_size: u64,
}

impl Database {
    /// Map `database.bin` and derive the geometry from its entry count.
    pub fn load(path: &Path) -> Result<Self, PirError> {
        let file = File::open(path).map_err(|e| {
            PirError::SnapshotUnavailable(format!("{}: {e}", path.display()))
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|e| {
            PirError::SnapshotUnavailable(format!("{}: {e}", path.display()))
        })?;

        Self::from_backing(Backing::Mapped(map))
    }

    /// In-memory database from raw snapshot bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, PirError> {
        Self::from_backing(Backing::Owned(bytes))
    }

    /// In-memory database from decoded entries.
    pub fn from_entries(entries: &[Entry]) -> Self {
        assert!(!entries.is_empty(), "database must hold at least one entry");
        let mut bytes = Vec::with_capacity(entries.len() * ENTRY_SIZE);
        for entry in entries {
            bytes.extend_from_slice(entry);
        }
        Self::from_backing(Backing::Owned(bytes)).unwrap()
    }

    fn from_backing(backing: Backing) -> Result<Self, PirError> {
        let len = backing.bytes().len();
        if len == 0 || len % ENTRY_SIZE != 0 {
            return Err(PirError::SnapshotIntegrityFailed(format!(
                "database length {len} is not a positive multiple of {ENTRY_SIZE}"
            )));
        }

        let n_raw = (len / ENTRY_SIZE) as u64;
        let (chunk_size, set_size) = derive_geometry(n_raw);
        Ok(Self {
            backing,
            n_raw,
            chunk_size,
            set_size,
        })
    }

    pub fn n_raw(&self) -> u64 {
        self.n_raw
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn set_size(&self) -> u64 {
        self.set_size
    }

    pub fn padded_len(&self) -> u64 {
        self.chunk_size * self.set_size
    }

    /// Plaintext word at `index`; anything past the stored entries is the
    /// zero word (the padding region is zero by construction).
    pub fn entry(&self, index: u64) -> Entry {
        let mut out = [0u8; ENTRY_SIZE];
        if index < self.n_raw {
            let offset = index as usize * ENTRY_SIZE;
            out.copy_from_slice(&self.backing.bytes()[offset..offset + ENTRY_SIZE]);
        }
        out
    }

    /// XOR of the selected words; out-of-range indices contribute zero.
    pub fn set_parity(&self, indices: &[u64]) -> Entry {
        let mut parity = [0u8; ENTRY_SIZE];
        for &index in indices {
            let entry = self.entry(index);
            xor_entry(&mut parity, &entry);
        }
        parity
    }

    /// Parity of the punctured set carried by a client query.
    pub fn punctured_parity(&self, request: &QueryRequest) -> Result<Entry, PirError> {
        if request.offsets.len() as u64 != self.set_size {
            return Err(PirError::BadRequest(format!(
                "expected {} offsets, got {}",
                self.set_size,
                request.offsets.len()
            )));
        }
        for &offset in &request.offsets {
            if offset >= self.chunk_size {
                return Err(PirError::BadRequest(format!(
                    "offset {offset} outside chunk of {}",
                    self.chunk_size
                )));
            }
        }

        let mut parity = [0u8; ENTRY_SIZE];
        for &alpha in &request.p {
            if alpha >= self.set_size {
                return Err(PirError::BadRequest(format!(
                    "block {alpha} outside set of {}",
                    self.set_size
                )));
            }
            let entry = self.entry(alpha * self.chunk_size + request.offsets[alpha as usize]);
            xor_entry(&mut parity, &entry);
        }
        Ok(parity)
    }

    /// Parity of the full set expanded from a client-supplied PRSet key.
    pub fn full_set_parity(&self, prf_key: [u8; 16]) -> Entry {
        let set = PrSet::new(prf_key, self.chunk_size);
        let mut parity = [0u8; ENTRY_SIZE];
        for alpha in 0..self.set_size {
            let entry = self.entry(alpha * self.chunk_size + set.offset(alpha));
            xor_entry(&mut parity, &entry);
        }
        parity
    }
}

/// Standalone pseudorandom set: one offset per block expanded from a
/// 16-byte key. Chunk sizes are powers of two, so the reduction is a mask
/// with no modulo bias.
pub struct PrSet {
    cipher: Aes128,
    chunk_size: u64,
}

impl PrSet {
    pub fn new(key: [u8; 16], chunk_size: u64) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
            chunk_size,
        }
    }

    pub fn offset(&self, block: u64) -> u64 {
        let mut input = [0u8; 16];
        input[8..16].copy_from_slice(&block.to_be_bytes());

        let mut buf = GenericArray::from(input);
        self.cipher.encrypt_block(&mut buf);
        u64::from_be_bytes(buf[0..8].try_into().unwrap()) & (self.chunk_size - 1)
    }
}

/// Split raw snapshot bytes into entries.
pub fn entries_from_bytes(bytes: &[u8]) -> Result<Vec<Entry>, PirError> {
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(PirError::SnapshotIntegrityFailed(format!(
            "snapshot length {} is not a multiple of {ENTRY_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(ENTRY_SIZE)
        .map(|chunk| {
            let mut entry = [0u8; ENTRY_SIZE];
            entry.copy_from_slice(chunk);
            entry
        })
        .collect())
}
