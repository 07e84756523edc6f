//! Aurumbot - double-bottom breakout trading core for gold
//!
//! Headless controller binary. The broker bridge is pluggable behind the
//! `BrokerBridge` trait; this build drives the simulated bridge over a
//! preloaded bar history (paper mode). Exit codes: 0 normal, 1 uncaught
//! error, 2 invalid configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurumbot::broker::{BrokerBridge, SimBroker};
use aurumbot::config::AppConfig;
use aurumbot::controller::TradingController;
use aurumbot::data::load_bars_json;
use aurumbot::pattern::DoubleBottomDetector;
use aurumbot::state::StateManager;

#[derive(Parser, Debug)]
#[command(name = "aurumbot", about = "Double-bottom breakout trading core")]
struct Cli {
    /// Run without the desktop UI.
    #[arg(long)]
    headless: bool,

    /// Path to the TOML configuration file.
    #[arg(long, env = "AURUM_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval in seconds between controller ticks.
    #[arg(long, default_value_t = 5)]
    poll: u64,

    /// Bar history (JSON array with indicators) for the paper bridge.
    #[arg(long, env = "AURUM_BARS", default_value = "data/bars.json")]
    bars: PathBuf,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aurumbot=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            std::process::exit(2);
        }
    };

    if let Err(e) = run(cli, config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    match &cli.config {
        Some(path) => AppConfig::load(path),
        None => AppConfig::from_env(),
    }
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    info!(
        symbol = %config.mt5.symbol,
        timeframe = %config.mt5.timeframe,
        risk_percent = config.risk.risk_percent,
        "aurumbot starting"
    );
    if !cli.headless {
        warn!("desktop UI is not part of this build, continuing headless");
    }

    let bars = load_bars_json(&cli.bars).context("loading bar history for the paper bridge")?;
    if bars.len() < 2 {
        anyhow::bail!("bar history too short: {} bars", bars.len());
    }

    let store = Arc::new(StateManager::new(&config).context("initializing state manager")?);
    let broker = Arc::new(SimBroker::new(bars, 10_000.0));
    let patterns = Arc::new(DoubleBottomDetector::from_config(&config));

    let controller = Arc::new(TradingController::new(
        config,
        broker.clone(),
        store,
        patterns,
    ));

    // Graceful shutdown on SIGINT / SIGTERM.
    spawn_signal_handler(controller.clone());

    // Paper mode: advance the sim bridge one bar per poll; when history is
    // exhausted, request a clean shutdown.
    let driver = {
        let controller = controller.clone();
        let broker = broker.clone();
        let poll = Duration::from_secs(cli.poll.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(poll).await;
                if !broker.advance() {
                    info!("bar history exhausted, shutting down");
                    controller.request_shutdown();
                    break;
                }
            }
        })
    };

    controller.run(Duration::from_secs(cli.poll.max(1))).await?;
    driver.abort();
    info!("aurumbot stopped");
    Ok(())
}

fn spawn_signal_handler<B>(controller: Arc<TradingController<B>>)
where
    B: BrokerBridge + 'static,
{
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("SIGINT received, shutting down"),
                _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("ctrl-c received, shutting down");
        }
        controller.request_shutdown();
    });
}
