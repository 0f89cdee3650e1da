//! Snapshot tooling for the PIR pipeline.
//!
//! Produces the artifacts the server and client consume: a packed
//! `database.bin`, its `manifest.json` with SHA-256 digests, delta
//! artifacts between two database versions, and random fixtures for
//! development.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use eyre::{bail, WrapErr};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::info;
use tracing_subscriber::EnvFilter;

use plinko::db::entries_from_bytes;
use plinko::params::{derive_geometry, xor_entry, BinomialMode, ENTRY_SIZE};
use plinko::wire::{write_delta_frame, DeltaUpdate, Manifest, ManifestFile};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plinko PIR snapshot tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Emit manifest.json for a packed database
    Manifest {
        /// Packed database file
        #[arg(long)]
        database: PathBuf,
        /// Snapshot version tag
        #[arg(long, default_value = "1")]
        version: String,
        /// Sampler mode clients must use with this snapshot
        #[arg(long, default_value = "normal_approx")]
        binomial_mode: BinomialMode,
        /// Extra artifact files to list (e.g. delta feeds)
        #[arg(long)]
        extra: Vec<PathBuf>,
        /// Output path
        #[arg(long, default_value = "manifest.json")]
        output: PathBuf,
    },
    /// Build a delta artifact from two database versions
    Diff {
        #[arg(long)]
        old: PathBuf,
        #[arg(long)]
        new: PathBuf,
        #[arg(long, default_value = "deltas.bin")]
        output: PathBuf,
    },
    /// Generate a random database fixture
    Random {
        #[arg(long)]
        entries: u64,
        #[arg(long, default_value = "database.bin")]
        output: PathBuf,
    },
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Manifest {
            database,
            version,
            binomial_mode,
            extra,
            output,
        } => manifest(&database, version, binomial_mode, &extra, &output),
        Command::Diff { old, new, output } => diff(&old, &new, &output),
        Command::Random { entries, output } => random(entries, &output),
    }
}

fn file_entry(path: &Path) -> eyre::Result<ManifestFile> {
    let bytes = fs::read(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    Ok(ManifestFile {
        path: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string()),
        size: bytes.len() as u64,
        sha256: hex::encode(Sha256::digest(&bytes)),
        ipfs: None,
    })
}

fn manifest(
    database: &Path,
    version: String,
    binomial_mode: BinomialMode,
    extra: &[PathBuf],
    output: &Path,
) -> eyre::Result<()> {
    let bytes = fs::read(database).wrap_err_with(|| format!("reading {}", database.display()))?;
    if bytes.is_empty() || bytes.len() % ENTRY_SIZE != 0 {
        bail!(
            "{} is not a positive multiple of {ENTRY_SIZE} bytes",
            database.display()
        );
    }

    let db_size = (bytes.len() / ENTRY_SIZE) as u64;
    let (chunk_size, set_size) = derive_geometry(db_size);

    let mut files = vec![file_entry(database)?];
    for path in extra {
        files.push(file_entry(path)?);
    }

    let manifest = Manifest {
        version,
        db_size,
        chunk_size,
        set_size,
        binomial_mode,
        files,
    };
    fs::write(output, serde_json::to_vec_pretty(&manifest)?)
        .wrap_err_with(|| format!("writing {}", output.display()))?;

    info!(
        db_size,
        chunk_size,
        set_size,
        output = %output.display(),
        "manifest written"
    );
    Ok(())
}

fn diff(old: &Path, new: &Path, output: &Path) -> eyre::Result<()> {
    let old_entries = entries_from_bytes(
        &fs::read(old).wrap_err_with(|| format!("reading {}", old.display()))?,
    )?;
    let new_entries = entries_from_bytes(
        &fs::read(new).wrap_err_with(|| format!("reading {}", new.display()))?,
    )?;
    if new_entries.len() < old_entries.len() {
        bail!("the database is append-only; the new version cannot shrink");
    }

    let mut updates = Vec::new();
    for (index, new_entry) in new_entries.iter().enumerate() {
        let mut delta = *new_entry;
        if let Some(old_entry) = old_entries.get(index) {
            xor_entry(&mut delta, old_entry);
        }
        if delta != [0u8; ENTRY_SIZE] {
            updates.push(DeltaUpdate {
                index: index as u64,
                flags: 0,
                delta,
            });
        }
    }

    let mut bytes = Vec::new();
    write_delta_frame(&mut bytes, &updates)?;
    fs::write(output, &bytes).wrap_err_with(|| format!("writing {}", output.display()))?;

    info!(
        changed = updates.len(),
        output = %output.display(),
        "delta artifact written"
    );
    Ok(())
}

fn random(entries: u64, output: &Path) -> eyre::Result<()> {
    if entries == 0 {
        bail!("a database needs at least one entry");
    }
    let mut bytes = vec![0u8; entries as usize * ENTRY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    fs::write(output, &bytes).wrap_err_with(|| format!("writing {}", output.display()))?;

    let (chunk_size, set_size) = derive_geometry(entries);
    info!(
        entries,
        chunk_size,
        set_size,
        output = %output.display(),
        "random database written"
    );
    Ok(())
}
