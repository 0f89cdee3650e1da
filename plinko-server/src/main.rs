//! Plinko PIR query server.
//!
//! Loads the packed database once at startup, then serves stateless XOR
//! folds over it. The database is read-only for the life of the process,
//! so request handlers share it without locks. Request bodies are never
//! logged; traces carry set sizes and timings only.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use eyre::{eyre, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use plinko::db::Database;
use plinko::wire::{
    decode_prf_key, encode_parity, FullSetRequest, FullSetResponse, QueryRequest, QueryResponse,
    ServerInfo, SetParityRequest, SetParityResponse,
};
use plinko::PirError;

#[derive(Parser, Debug)]
#[command(author, version, about = "Plinko PIR query server")]
struct Args {
    /// Path to the packed database file
    #[arg(long, env = "PLINKO_PIR_DATABASE_PATH")]
    database_path: PathBuf,

    /// TCP listen port
    #[arg(long, env = "PLINKO_PIR_SERVER_PORT", default_value_t = 8080)]
    port: u16,

    /// Seconds to wait for the database file to appear at startup
    #[arg(long, env = "PLINKO_PIR_DATABASE_TIMEOUT_SECONDS", default_value_t = 60)]
    database_timeout_seconds: u64,

    /// Snapshot version tag reported to clients
    #[arg(long, env = "PLINKO_PIR_SNAPSHOT_VERSION", default_value = "dev")]
    snapshot_version: String,

    /// Expose the plaintext lookup route (diagnostics only, never for
    /// end users)
    #[arg(long, env = "PLINKO_PIR_ENABLE_PLAINTEXT_LOOKUP")]
    enable_plaintext_lookup: bool,
}

struct AppState {
    db: Database,
    snapshot_version: String,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    wait_for_database(&args.database_path, args.database_timeout_seconds).await?;
    let db = Database::load(&args.database_path)
        .wrap_err_with(|| format!("loading {}", args.database_path.display()))?;
    info!(
        entries = db.n_raw(),
        chunk_size = db.chunk_size(),
        set_size = db.set_size(),
        "database loaded"
    );

    let state = Arc::new(AppState {
        db,
        snapshot_version: args.snapshot_version,
    });

    let mut app = Router::new()
        .route("/query", post(handle_query))
        .route("/set-parity", post(handle_set_parity))
        .route("/full-set", post(handle_full_set))
        .route("/info", get(handle_info))
        .route("/health", get(|| async { "ok" }));
    if args.enable_plaintext_lookup {
        warn!("plaintext lookup route enabled; do not expose this to end users");
        app = app.route("/lookup/:index", get(handle_lookup));
    }
    let app = app.with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .wrap_err_with(|| format!("binding {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .wrap_err("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Poll for the database file; deployments often start the server before
/// the snapshot pipeline has finished writing it.
async fn wait_for_database(path: &std::path::Path, timeout_seconds: u64) -> eyre::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(timeout_seconds);
    while !path.exists() {
        if Instant::now() >= deadline {
            return Err(eyre!(
                "database {} did not appear within {timeout_seconds}s",
                path.display()
            ));
        }
        info!(path = %path.display(), "waiting for database file");
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");
}

/// Error wrapper that maps the core taxonomy onto HTTP statuses without
/// echoing request contents.
struct ApiError(PirError);

impl From<PirError> for ApiError {
    fn from(e: PirError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            PirError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

async fn handle_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let start = Instant::now();
    let parity = state.db.punctured_parity(&request)?;
    let elapsed = start.elapsed();

    info!(
        punctured = request.p.len(),
        nanos = elapsed.as_nanos() as u64,
        "query served"
    );
    Ok(Json(QueryResponse {
        r0: encode_parity(&parity),
        r1: "0".to_string(),
        server_time_nanos: elapsed.as_nanos() as u64,
    }))
}

async fn handle_set_parity(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SetParityRequest>,
) -> Json<SetParityResponse> {
    let parity = state.db.set_parity(&request.indices);
    Json(SetParityResponse {
        parity: encode_parity(&parity),
    })
}

async fn handle_full_set(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FullSetRequest>,
) -> Result<Json<FullSetResponse>, ApiError> {
    let key = decode_prf_key(&request.prf_key)?;
    let parity = state.db.full_set_parity(key);
    Ok(Json(FullSetResponse {
        value: encode_parity(&parity),
    }))
}

async fn handle_info(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo {
        db_size: state.db.n_raw(),
        chunk_size: state.db.chunk_size(),
        set_size: state.db.set_size(),
        snapshot_version: state.snapshot_version.clone(),
    })
}

async fn handle_lookup(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u64>,
) -> Json<FullSetResponse> {
    Json(FullSetResponse {
        value: encode_parity(&state.db.entry(index)),
    })
}
