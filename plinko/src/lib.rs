//! Plinko single-server PIR core.
//!
//! Client/server pair for reading one entry of a large, append-updatable
//! database without revealing which entry was read:
//! - `prp`: small-domain permutation (4-round Feistel + cycle-walking)
//! - `binomial`: deterministic binomial samplers backing the PMNS tree
//! - `pmns`: pseudorandom multinomial sampler with efficient inverse
//! - `iprf`: invertible PRF composing the two
//! - `hint`: client hint table and keyed set membership
//! - `engine`: client engine (hint init, query, reconstruct, delta apply)
//! - `db`: server database core (set-parity folds, PRSet expansion)
//! - `wire`: query/manifest/delta wire formats
//! - `cache`: hint-table persistence
//!
//! Everything here is synchronous and I/O-free; transport and storage live
//! in the `plinko-server` and `plinko-client` binaries.

pub mod binomial;
pub mod cache;
pub mod db;
pub mod engine;
pub mod error;
pub mod hint;
pub mod iprf;
pub mod params;
pub mod pmns;
pub mod prp;
pub mod wire;

pub use engine::{ClientEngine, PendingQuery};
pub use error::PirError;
pub use params::{BinomialMode, Entry, PirParams, ENTRY_SIZE};
