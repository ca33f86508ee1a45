mod handlers;
mod metrics;
mod routes;
mod sessions;

use anyhow::{Context, Result};
use axum::Router;
use mastery_common::content::ChallengeCatalog;
use mastery_sandbox::TrackConfigManager;
use sessions::{SessionLimits, SessionRegistry};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub struct AppState {
    pub sessions: SessionRegistry,
    pub catalog: ChallengeCatalog,
    pub tracks: TrackConfigManager,
}

impl AppState {
    pub fn new(catalog: ChallengeCatalog, tracks: TrackConfigManager, limits: SessionLimits) -> Self {
        Self {
            sessions: SessionRegistry::new(limits),
            catalog,
            tracks,
        }
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new().merge(routes::routes()).with_state(state)
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_tracks() -> Result<TrackConfigManager> {
    let tracks = match std::env::var("TRACKS_CONFIG") {
        Ok(path) => TrackConfigManager::load(Path::new(&path))?,
        Err(_) => TrackConfigManager::load_default()?,
    };
    Ok(tracks.with_env_overrides())
}

fn load_catalog() -> Result<ChallengeCatalog> {
    let dir = std::env::var("CHALLENGES_DIR").unwrap_or_else(|_| "content".to_string());
    let dir = Path::new(&dir);
    if !dir.is_dir() {
        warn!("Content directory {} not found, serving no challenges", dir.display());
        return Ok(ChallengeCatalog::default());
    }
    ChallengeCatalog::load_dir(dir)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Mastery sandbox API booting...");

    let tracks = load_tracks().context("Failed to load track configuration")?;
    info!(tracks = ?tracks.list_tracks(), "Track configuration loaded");

    let catalog = load_catalog().context("Failed to load challenge content")?;
    info!(challenges = catalog.len(), "Challenge catalog ready");

    let state = Arc::new(AppState::new(catalog, tracks, SessionLimits::from_env()));
    sessions::start_idle_sweeper(state.clone());
    let app = app(state);

    let addr = std::env::var("MASTERY_API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept sessions");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
