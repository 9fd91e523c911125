mod api;
mod config;
mod db;
mod detector;
mod error;
mod fetcher;
mod retry;
mod scan;
mod types;
mod validate;

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::routes::{router, ApiState};
use crate::config::Config;
use crate::db::Store;
use crate::error::{AppError, Result};
use crate::fetcher::{HistoryClient, QuoteClient, ScreenerClient};
use crate::scan::{ScanService, Sources};
use crate::types::{ScanKind, ScanStatus};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    match run(cfg).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Fatal error: {e}");
            std::process::exit(1);
        }
    }
}

/// Returns the process exit code: 0 completed, 2 partial, 1 failed.
async fn run(cfg: Config) -> Result<i32> {
    // --- Database setup ---
    let store = Store::connect(&cfg.db_path).await?;
    store.recover_stale_runs().await?;

    // --- Upstreams ---
    let sources = Sources {
        screener: Arc::new(ScreenerClient::new(cfg.screener_api_url.clone())?),
        history: Arc::new(HistoryClient::new(&cfg)?),
        quotes: Arc::new(QuoteClient::new(&cfg)?),
    };
    let service = ScanService::new(store.clone(), sources, Arc::new(HealthState::new()));

    // --- One-shot mode: run a single scan and exit ---
    if let Some(raw) = cfg.oneshot.as_deref() {
        let kind: ScanKind = raw.parse().map_err(AppError::Config)?;
        info!("[STARTUP] one-shot {kind} scan");
        let summary = service.run_to_completion(kind).await?;
        return Ok(match summary.status {
            ScanStatus::Completed => 0,
            ScanStatus::Partial => 2,
            ScanStatus::Failed | ScanStatus::Running => 1,
        });
    }

    // --- HTTP API server ---
    let app = router(ApiState { store, service });
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("HTTP API listening on {bind_addr}");

    axum::serve(listener, app).await?;

    Ok(0)
}
