//! Error taxonomy shared by the client and server halves of the protocol.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PirError {
    /// Manifest or artifact fetch failed on every candidate URL.
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    /// Artifact bytes failed validation (hash mismatch, bad framing);
    /// the bytes are discarded and never cached.
    #[error("snapshot integrity check failed: {0}")]
    SnapshotIntegrityFailed(String),

    /// Cached hint table does not match the current format, key, or
    /// snapshot; the client regenerates silently.
    #[error("hint cache incompatible: {0}")]
    HintCacheIncompatible(String),

    /// No usable hint covers the requested cell; the caller refreshes and
    /// retries before surfacing this.
    #[error("no usable hint for block {block} offset {offset}")]
    HintExhausted { block: u64, offset: u64 },

    /// Malformed request rejected by the server (HTTP 400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Server unreachable or transport failure; retried with backoff.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Server geometry disagrees with the client's derived parameters;
    /// the client refuses to query until refreshed.
    #[error(
        "parameter mismatch: client (chunk={client_chunk}, set={client_set}) \
         vs server (chunk={server_chunk}, set={server_set})"
    )]
    ParameterMismatch {
        client_chunk: u64,
        client_set: u64,
        server_chunk: u64,
        server_set: u64,
    },

    /// Impossible under hint integrity; indicates a protocol-level bug.
    #[error("reconstruction inconsistency: {0}")]
    ReconstructInconsistency(String),
}

impl PirError {
    /// Transport-level kinds worth retrying with bounded backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PirError::SnapshotUnavailable(_) | PirError::UpstreamUnavailable(_)
        )
    }

    /// Correctness kinds that must abort instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PirError::ReconstructInconsistency(_))
    }
}
