//! Local persistence: master secret, hint cache, last-applied delta height.

use std::fs;
use std::path::{Path, PathBuf};

use eyre::{eyre, WrapErr};
use rand::RngCore;
use tracing::{debug, info};

use plinko::cache::{decode_hint_cache, encode_hint_cache, CacheKey};
use plinko::hint::HintTable;

/// Load the 32-byte master secret, creating it on first run.
pub fn load_or_create_secret(path: &Path) -> eyre::Result<[u8; 32]> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let bytes = hex::decode(text.trim())
            .wrap_err_with(|| format!("decoding {}", path.display()))?;
        return bytes
            .try_into()
            .map_err(|_| eyre!("{} does not hold a 32-byte secret", path.display()));
    }

    let mut secret = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut secret);
    write_secret(path, &secret)?;
    info!(path = %path.display(), "created master secret");
    Ok(secret)
}

/// Persist the secret (also called after a refresh rotates it).
pub fn write_secret(path: &Path, secret: &[u8; 32]) -> eyre::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok();
    }
    fs::write(path, hex::encode(secret))
        .wrap_err_with(|| format!("writing {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .wrap_err_with(|| format!("restricting {}", path.display()))?;
    }
    Ok(())
}

fn hint_cache_path(cache_dir: &Path, key: &CacheKey) -> PathBuf {
    cache_dir.join(format!(
        "hints-v{}-{}-{}.bin",
        key.format_version,
        hex::encode(key.snapshot_hash_prefix),
        hex::encode(key.master_key_hash_prefix)
    ))
}

/// Try to restore a hint table matching `key`; any incompatibility is
/// reported as `None` so the caller regenerates silently.
pub fn load_hint_cache(cache_dir: &Path, key: &CacheKey) -> Option<(HintTable, u64, u64)> {
    let path = hint_cache_path(cache_dir, key);
    let bytes = fs::read(&path).ok()?;
    match decode_hint_cache(&bytes, key) {
        Ok(restored) => {
            debug!(path = %path.display(), "hint cache restored");
            Some(restored)
        }
        Err(e) => {
            debug!(path = %path.display(), %e, "discarding stale hint cache");
            fs::remove_file(&path).ok();
            None
        }
    }
}

pub fn save_hint_cache(
    cache_dir: &Path,
    key: &CacheKey,
    table: &HintTable,
    delta_height: u64,
    consumed: u64,
) -> eyre::Result<()> {
    fs::create_dir_all(cache_dir)
        .wrap_err_with(|| format!("creating {}", cache_dir.display()))?;
    let path = hint_cache_path(cache_dir, key);
    fs::write(&path, encode_hint_cache(key, table, delta_height, consumed))
        .wrap_err_with(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Snapshot bytes cached under their SHA-256 prefix.
pub fn snapshot_cache_path(cache_dir: &Path, digest: &[u8; 32]) -> PathBuf {
    cache_dir.join(format!("snapshot-{}.bin", hex::encode(&digest[0..8])))
}

pub fn load_cached_snapshot(cache_dir: &Path, digest: &[u8; 32]) -> Option<Vec<u8>> {
    fs::read(snapshot_cache_path(cache_dir, digest)).ok()
}

pub fn save_cached_snapshot(cache_dir: &Path, digest: &[u8; 32], bytes: &[u8]) -> eyre::Result<()> {
    fs::create_dir_all(cache_dir)
        .wrap_err_with(|| format!("creating {}", cache_dir.display()))?;
    let path = snapshot_cache_path(cache_dir, digest);
    fs::write(&path, bytes).wrap_err_with(|| format!("writing {}", path.display()))?;
    Ok(())
}
