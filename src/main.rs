// =============================================================================
// minute-bars — Main Entry Point
// =============================================================================
//
// `minute-bars fetch [TICKERS..] [--init]` runs one update cycle in the
// foreground; `minute-bars serve` exposes the query API and lets clients
// trigger cycles in the background.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod indicators;
mod provider;
mod runtime_config;
mod status;
mod store;
mod types;
mod updater;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::provider::YahooProvider;
use crate::runtime_config::{ServiceConfig, DEFAULT_CONFIG_PATH};

#[derive(Debug, Parser)]
#[command(name = "minute-bars", version, about = "Incremental minute-bar fetcher and query API")]
struct Cli {
    /// Path to the JSON service config.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch and merge new bars for the given tickers (default set when none).
    Fetch {
        tickers: Vec<String>,

        /// Discard existing records and re-seed from the full history window.
        #[arg(long)]
        init: bool,
    },
    /// Serve the query API.
    Serve {
        /// Listen address, overriding the config file.
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load_or_default(&cli.config)?;

    info!(
        data_dir = %config.data_dir.display(),
        tickers = ?config.default_tickers,
        timezone = %config.market_timezone,
        "minute-bars starting"
    );

    // ── 2. Provider & shared state ───────────────────────────────────────
    let provider = YahooProvider::new(config.provider_base_url.clone(), config.request_timeout())
        .context("failed to build market-data HTTP client")?;

    match cli.command {
        Command::Fetch { tickers, init } => {
            let state = AppState::new(config, provider)?;
            run_fetch(&state, &tickers, init).await
        }
        Command::Serve { bind } => {
            let mut config = config;
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            let state = Arc::new(AppState::new(config, provider)?);
            run_server(state).await
        }
    }
}

async fn run_fetch(state: &AppState<YahooProvider>, tickers: &[String], init: bool) -> anyhow::Result<()> {
    let outcome = state.run_update(tickers, init).await?;

    for report in &outcome.reports {
        info!(
            ticker = %report.ticker,
            days_fetched = report.days_fetched,
            bars_fetched = report.bars_fetched,
            days_stored = report.days_stored,
            written = report.written,
            "done"
        );
    }
    match outcome.error_message() {
        None => Ok(()),
        Some(msg) => bail!("update finished with failures: {msg}"),
    }
}

async fn run_server(state: Arc<AppState<YahooProvider>>) -> anyhow::Result<()> {
    let bind_addr = state.config.bind_addr.clone();
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    info!("API server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
