//! Plinko PIR client.
//!
//! `init` acquires and verifies a snapshot, builds the hint table, and
//! persists it; `query` performs one private read against the query
//! server; `sync` folds a delta artifact into the stored hints. The
//! engine itself is synchronous; this binary owns all I/O and serializes
//! queries against delta application.

mod fetch;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use eyre::{eyre, WrapErr};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plinko::cache::{CacheKey, HINT_FORMAT_VERSION};
use plinko::db::entries_from_bytes;
use plinko::engine::ClientEngine;
use plinko::wire::{read_delta_frames, decode_parity, QueryResponse, ServerInfo};
use plinko::{BinomialMode, Entry, PirError, PirParams};

use fetch::Fetcher;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plinko PIR client")]
struct Cli {
    #[command(flatten)]
    config: ClientConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct ClientConfig {
    /// PIR query server endpoint
    #[arg(long, env = "PLINKO_PIR_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    server_url: String,

    /// Snapshot manifest URL (CDN or gateway)
    #[arg(long, env = "PLINKO_PIR_MANIFEST_URL")]
    manifest_url: Option<String>,

    /// Master secret storage path
    #[arg(long, env = "PLINKO_PIR_SECRET_STORE", default_value = "plinko-secret.hex")]
    secret_store: PathBuf,

    /// Directory for hint and snapshot caches
    #[arg(long, env = "PLINKO_PIR_CACHE_DIR", default_value = ".plinko-cache")]
    cache_dir: PathBuf,

    /// Hint cache format version; bump to invalidate old caches
    #[arg(long, default_value_t = HINT_FORMAT_VERSION)]
    hint_format_version: u32,

    /// Binomial sampler mode used when no manifest dictates one
    #[arg(long, default_value = "normal_approx")]
    binomial_mode: BinomialMode,

    /// Backup-hint multiplier (8 for dev, 64+ for production)
    #[arg(long, default_value_t = 8)]
    lambda: u64,

    /// Consumed-hint limit before a refresh is forced
    #[arg(long, default_value_t = 1024)]
    query_budget: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch (or read) a snapshot, build the hint table, persist it
    Init {
        /// Local snapshot file instead of the manifest pipeline
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Privately read one database entry
    Query { index: u64 },
    /// Apply a delta artifact to the stored hints
    Sync {
        /// Delta artifact file
        #[arg(long)]
        deltas: PathBuf,
        /// Block height the artifact corresponds to
        #[arg(long)]
        height: u64,
    },
    /// Show server parameters and local state
    Info,
}

/// Init-time facts `query` and `sync` rely on later.
#[derive(Debug, Serialize, Deserialize)]
struct ClientState {
    snapshot_sha256: String,
    db_size: u64,
    binomial_mode: BinomialMode,
    lambda: u64,
    query_budget: u64,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init { snapshot } => init(&cli.config, snapshot).await,
        Command::Query { index } => query(&cli.config, index).await,
        Command::Sync { deltas, height } => sync(&cli.config, deltas, height),
        Command::Info => show_info(&cli.config).await,
    }
}

fn state_path(config: &ClientConfig) -> PathBuf {
    config.cache_dir.join("state.json")
}

fn load_state(config: &ClientConfig) -> eyre::Result<ClientState> {
    let path = state_path(config);
    let bytes = std::fs::read(&path)
        .wrap_err_with(|| format!("no client state at {}; run `init` first", path.display()))?;
    serde_json::from_slice(&bytes).wrap_err("client state is corrupt; re-run `init`")
}

fn save_state(config: &ClientConfig, state: &ClientState) -> eyre::Result<()> {
    std::fs::create_dir_all(&config.cache_dir)?;
    std::fs::write(state_path(config), serde_json::to_vec_pretty(state)?)?;
    Ok(())
}

/// Fetch the snapshot named by the manifest, preferring the local cache.
async fn obtain_remote_snapshot(
    config: &ClientConfig,
) -> eyre::Result<(Vec<u8>, BinomialMode)> {
    let manifest_url = config
        .manifest_url
        .as_deref()
        .ok_or_else(|| eyre!("either --snapshot or --manifest-url is required"))?;

    let fetcher = Fetcher::new();
    let manifest = fetcher.manifest(manifest_url).await?;
    let file = manifest
        .files
        .iter()
        .find(|f| f.path.ends_with("database.bin"))
        .ok_or_else(|| eyre!("manifest lists no database.bin"))?;

    let digest: [u8; 32] = hex::decode(&file.sha256)
        .ok()
        .and_then(|d| d.try_into().ok())
        .ok_or_else(|| eyre!("manifest sha256 for {} is malformed", file.path))?;

    if let Some(bytes) = store::load_cached_snapshot(&config.cache_dir, &digest) {
        if fetch::verify_sha256(&bytes, &file.sha256).is_ok() {
            info!("using cached snapshot");
            return Ok((bytes, manifest.binomial_mode));
        }
    }

    let bytes = fetcher.verified_artifact(manifest_url, file).await?;
    store::save_cached_snapshot(&config.cache_dir, &digest, &bytes)?;
    Ok((bytes, manifest.binomial_mode))
}

async fn obtain_snapshot(
    config: &ClientConfig,
    local: Option<PathBuf>,
) -> eyre::Result<(Vec<u8>, BinomialMode)> {
    match local {
        Some(path) => {
            let bytes = std::fs::read(&path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            Ok((bytes, config.binomial_mode))
        }
        None => obtain_remote_snapshot(config).await,
    }
}

/// Build the hint table off the async runtime; generation is CPU-bound.
async fn build_engine(
    secret: [u8; 32],
    params: PirParams,
    entries: Vec<Entry>,
) -> eyre::Result<ClientEngine> {
    let bar = ProgressBar::new_spinner();
    bar.set_message(format!(
        "building {} hints over {} entries",
        params.hint_domain(),
        params.n_raw
    ));
    bar.enable_steady_tick(Duration::from_millis(120));

    let engine = tokio::task::spawn_blocking(move || {
        let mut engine = ClientEngine::new(secret, params);
        engine.hint_init(&entries);
        engine
    })
    .await
    .wrap_err("hint generation worker panicked")?;

    bar.finish_and_clear();
    Ok(engine)
}

fn persist_engine(config: &ClientConfig, snapshot_digest: &[u8; 32], engine: &ClientEngine) -> eyre::Result<()> {
    let key = CacheKey::new(
        config.hint_format_version,
        engine.params().binomial_mode,
        snapshot_digest,
        engine.master_secret(),
    );
    store::save_hint_cache(
        &config.cache_dir,
        &key,
        engine.hints(),
        engine.delta_height(),
        engine.consumed_queries(),
    )
}

async fn init(config: &ClientConfig, snapshot: Option<PathBuf>) -> eyre::Result<()> {
    let (bytes, mode) = obtain_snapshot(config, snapshot).await?;
    let digest = fetch::snapshot_digest(&bytes);
    let entries = entries_from_bytes(&bytes)?;

    let secret = store::load_or_create_secret(&config.secret_store)?;
    let params = PirParams::derive(entries.len() as u64, config.lambda, config.query_budget, mode);
    info!(
        entries = params.n_raw,
        chunk_size = params.chunk_size,
        set_size = params.set_size,
        hints = params.hint_domain(),
        "deriving hint table"
    );

    let engine = build_engine(secret, params, entries).await?;
    persist_engine(config, &digest, &engine)?;
    save_state(
        config,
        &ClientState {
            snapshot_sha256: hex::encode(digest),
            db_size: params.n_raw,
            binomial_mode: mode,
            lambda: config.lambda,
            query_budget: config.query_budget,
        },
    )?;

    println!(
        "initialized: {} entries, {} hints ({} backup), snapshot {}",
        params.n_raw,
        params.num_hints(),
        params.backup_hints(),
        &hex::encode(digest)[0..16]
    );
    Ok(())
}

/// Restore the engine from the persisted state and hint cache.
fn restore_engine(config: &ClientConfig) -> eyre::Result<(ClientEngine, ClientState, [u8; 32])> {
    let state = load_state(config)?;
    let secret = store::load_or_create_secret(&config.secret_store)?;
    let digest: [u8; 32] = hex::decode(&state.snapshot_sha256)
        .ok()
        .and_then(|d| d.try_into().ok())
        .ok_or_else(|| eyre!("client state holds a malformed snapshot digest"))?;

    let params = PirParams::derive(
        state.db_size,
        state.lambda,
        state.query_budget,
        state.binomial_mode,
    );
    let key = CacheKey::new(config.hint_format_version, state.binomial_mode, &digest, &secret);

    let mut engine = ClientEngine::new(secret, params);
    match store::load_hint_cache(&config.cache_dir, &key) {
        Some((table, height, consumed)) => {
            engine
                .restore_hints(table, height, consumed)
                .map_err(|e| eyre!(e))?;
        }
        None => {
            // Incompatible or missing cache: regenerate silently from the
            // cached snapshot.
            let bytes = store::load_cached_snapshot(&config.cache_dir, &digest)
                .ok_or_else(|| eyre!("hint cache unusable and no cached snapshot; re-run `init`"))?;
            fetch::verify_sha256(&bytes, &state.snapshot_sha256).map_err(|e| eyre!(e))?;
            info!("regenerating hint table from cached snapshot");
            let entries = entries_from_bytes(&bytes)?;
            engine.hint_init(&entries);
            persist_engine(config, &digest, &engine)?;
        }
    }
    Ok((engine, state, digest))
}

/// Refuse to query a server whose geometry disagrees with ours.
async fn handshake(
    client: &reqwest::Client,
    config: &ClientConfig,
    params: &PirParams,
) -> eyre::Result<()> {
    let info: ServerInfo = client
        .get(format!("{}/info", config.server_url))
        .send()
        .await
        .map_err(|e| PirError::UpstreamUnavailable(e.to_string()))?
        .error_for_status()
        .map_err(|e| PirError::UpstreamUnavailable(e.to_string()))?
        .json()
        .await
        .map_err(|e| PirError::UpstreamUnavailable(e.to_string()))?;

    if info.chunk_size != params.chunk_size || info.set_size != params.set_size {
        return Err(PirError::ParameterMismatch {
            client_chunk: params.chunk_size,
            client_set: params.set_size,
            server_chunk: info.chunk_size,
            server_set: info.set_size,
        }
        .into());
    }
    if info.db_size != params.n_raw {
        return Err(eyre!(
            "server holds {} entries but hints were built over {}; re-run `init`",
            info.db_size,
            params.n_raw
        ));
    }
    Ok(())
}

async fn query(config: &ClientConfig, index: u64) -> eyre::Result<()> {
    let (mut engine, state, digest) = restore_engine(config)?;
    if index >= state.db_size {
        return Err(eyre!("index {index} outside database of {}", state.db_size));
    }

    if let Some(entry) = engine.cached(index) {
        println!("{}", hex::encode(entry));
        return Ok(());
    }

    let client = reqwest::Client::new();
    handshake(&client, config, engine.params()).await?;

    let (request, pending) = match engine.query(index) {
        Ok(ok) => ok,
        Err(PirError::HintExhausted { .. }) => {
            // Refresh from the cached snapshot rotates the secret, then
            // retry once.
            warn!("usable hints exhausted; refreshing hint table");
            let bytes = store::load_cached_snapshot(&config.cache_dir, &digest)
                .ok_or_else(|| eyre!("hints exhausted and no cached snapshot; re-run `init`"))?;
            let entries = entries_from_bytes(&bytes)?;
            engine.refresh(&entries);
            store::write_secret(&config.secret_store, engine.master_secret())?;
            persist_engine(config, &digest, &engine)?;
            engine.query(index).map_err(|e| eyre!(e))?
        }
        Err(other) => return Err(other.into()),
    };

    let response = match post_query(&client, config, &request).await {
        Ok(response) => response,
        Err(e) => {
            // No partial reconstruction: release the hint untouched.
            engine.cancel(pending);
            return Err(e);
        }
    };

    let parity = match decode_parity(&response.r0) {
        Ok(parity) => parity,
        Err(e) => {
            engine.cancel(pending);
            return Err(e.into());
        }
    };

    let entry = engine.reconstruct(pending, &parity);
    persist_engine(config, &digest, &engine)?;

    println!("{}", hex::encode(entry));
    Ok(())
}

/// POST the query with bounded retries on transport failures.
async fn post_query(
    client: &reqwest::Client,
    config: &ClientConfig,
    request: &plinko::wire::QueryRequest,
) -> eyre::Result<QueryResponse> {
    let url = format!("{}/query", config.server_url);
    let mut last_err = None;

    for attempt in 0..3u32 {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(250 << attempt)).await;
        }
        match client.post(&url).json(request).send().await {
            Ok(response) => match response.error_for_status() {
                Ok(response) => {
                    return response
                        .json::<QueryResponse>()
                        .await
                        .map_err(|e| eyre!(PirError::UpstreamUnavailable(e.to_string())));
                }
                Err(e) if e.status() == Some(reqwest::StatusCode::BAD_REQUEST) => {
                    return Err(eyre!(PirError::BadRequest("server rejected query".into())));
                }
                Err(e) => last_err = Some(e),
            },
            Err(e) => last_err = Some(e),
        }
    }
    Err(eyre!(PirError::UpstreamUnavailable(
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}

fn sync(config: &ClientConfig, deltas: PathBuf, height: u64) -> eyre::Result<()> {
    let (mut engine, _state, digest) = restore_engine(config)?;

    let bytes = std::fs::read(&deltas)
        .wrap_err_with(|| format!("reading {}", deltas.display()))?;
    let updates = read_delta_frames(&mut bytes.as_slice())?;
    if height < engine.delta_height() {
        return Err(eyre!(
            "artifact height {height} below already-applied {}",
            engine.delta_height()
        ));
    }

    let pairs: Vec<(u64, Entry)> = updates.iter().map(|u| (u.index, u.delta)).collect();
    engine.apply_delta_batch(height, &pairs);
    persist_engine(config, &digest, &engine)?;

    println!("applied {} updates at height {height}", pairs.len());
    Ok(())
}

async fn show_info(config: &ClientConfig) -> eyre::Result<()> {
    let client = reqwest::Client::new();
    let info: ServerInfo = client
        .get(format!("{}/info", config.server_url))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    println!(
        "server: {} entries, chunk_size {}, set_size {}, snapshot {}",
        info.db_size, info.chunk_size, info.set_size, info.snapshot_version
    );

    match load_state(config) {
        Ok(state) => {
            println!(
                "local:  {} entries, lambda {}, mode {}, snapshot {}",
                state.db_size,
                state.lambda,
                state.binomial_mode,
                &state.snapshot_sha256[0..16]
            );
        }
        Err(_) => println!("local:  uninitialized (run `init`)"),
    }
    Ok(())
}
