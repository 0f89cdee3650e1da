//! Snapshot and delta artifact acquisition.
//!
//! Every artifact is fetched with bounded exponential backoff, verified
//! against its manifest SHA-256 before use, and never written to disk on a
//! digest mismatch. Each file may carry an IPFS gateway fallback that is
//! tried after the primary URL fails or fails verification.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use plinko::wire::{Manifest, ManifestFile};
use plinko::PirError;

const FETCH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn manifest(&self, url: &str) -> Result<Manifest, PirError> {
        let bytes = self.get_with_backoff(url).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            PirError::SnapshotIntegrityFailed(format!("manifest at {url}: {e}"))
        })
    }

    /// Download one manifest file, trying the primary URL then the IPFS
    /// fallback, verifying the digest of whichever answers.
    pub async fn verified_artifact(
        &self,
        manifest_url: &str,
        file: &ManifestFile,
    ) -> Result<Vec<u8>, PirError> {
        let mut last_err = PirError::SnapshotUnavailable(format!("no source for {}", file.path));

        for url in candidate_urls(manifest_url, file) {
            match self.get_with_backoff(&url).await {
                Ok(bytes) => match verify_sha256(&bytes, &file.sha256) {
                    Ok(()) => {
                        debug!(url, size = bytes.len(), "artifact verified");
                        return Ok(bytes);
                    }
                    Err(e) => {
                        // Discard the bytes; an integrity failure on one
                        // mirror must not poison the others.
                        warn!(url, %e, "artifact failed verification");
                        last_err = e;
                    }
                },
                Err(e) => {
                    warn!(url, %e, "artifact fetch failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn get_with_backoff(&self, url: &str) -> Result<Vec<u8>, PirError> {
        let mut last_err = None;
        for attempt in 0..FETCH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(BACKOFF_BASE_MS << attempt)).await;
            }
            match self.try_get(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => last_err = Some(e),
            }
        }
        Err(PirError::SnapshotUnavailable(format!(
            "{url} after {FETCH_ATTEMPTS} attempts: {}",
            last_err.expect("at least one attempt")
        )))
    }

    async fn try_get(&self, url: &str) -> Result<Vec<u8>, reqwest::Error> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let total = response.content_length().unwrap_or(0);
        if total > 1 << 20 {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template("{msg} {bytes}/{total_bytes} [{bar:30}]")
                    .expect("static template"),
            );
            bar.set_message(url.to_string());
            let bytes = response.bytes().await?;
            bar.finish_and_clear();
            Ok(bytes.to_vec())
        } else {
            Ok(response.bytes().await?.to_vec())
        }
    }
}

/// Primary URL (manifest-relative path) followed by the IPFS fallback.
fn candidate_urls(manifest_url: &str, file: &ManifestFile) -> Vec<String> {
    let base = manifest_url.rsplit_once('/').map(|(b, _)| b).unwrap_or(manifest_url);
    let mut urls = vec![format!("{base}/{}", file.path)];

    if let Some(ipfs) = &file.ipfs {
        match &ipfs.gateway_url {
            Some(gateway) => urls.push(gateway.clone()),
            None => urls.push(format!("https://ipfs.io/ipfs/{}", ipfs.cid)),
        }
    }
    urls
}

pub fn verify_sha256(bytes: &[u8], expected_hex: &str) -> Result<(), PirError> {
    let digest = Sha256::digest(bytes);
    let actual = hex::encode(digest);
    if !actual.eq_ignore_ascii_case(expected_hex) {
        return Err(PirError::SnapshotIntegrityFailed(format!(
            "sha256 {actual} does not match manifest {expected_hex}"
        )));
    }
    Ok(())
}

/// Digest of snapshot bytes, used to key the hint cache.
pub fn snapshot_digest(bytes: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(bytes);
    digest.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plinko::wire::IpfsPointer;

    fn file(path: &str, ipfs: Option<IpfsPointer>) -> ManifestFile {
        ManifestFile {
            path: path.to_string(),
            size: 0,
            sha256: String::new(),
            ipfs,
        }
    }

    #[test]
    fn candidates_resolve_relative_to_the_manifest() {
        let urls = candidate_urls("https://cdn.example/snap/manifest.json", &file("database.bin", None));
        assert_eq!(urls, vec!["https://cdn.example/snap/database.bin"]);
    }

    #[test]
    fn ipfs_fallback_comes_after_the_primary() {
        let urls = candidate_urls(
            "https://cdn.example/snap/manifest.json",
            &file(
                "database.bin",
                Some(IpfsPointer {
                    cid: "bafyfoo".into(),
                    gateway_url: None,
                }),
            ),
        );
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[1], "https://ipfs.io/ipfs/bafyfoo");
    }

    #[test]
    fn sha256_verification_rejects_tampering() {
        let bytes = b"plinko snapshot";
        let good = hex::encode(Sha256::digest(bytes));
        assert!(verify_sha256(bytes, &good).is_ok());
        assert!(verify_sha256(b"plinko snapshot!", &good).is_err());
    }
}
