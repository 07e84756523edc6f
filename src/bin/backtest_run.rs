//! Historical replay runner
//!
//! Replays a bar history file through the exact decision path the live
//! controller uses and prints the resulting trade statistics. Ctrl-C
//! cancels between bars. Exit codes: 0 normal, 1 error, 2 bad config.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aurumbot::backtest::{BacktestEngine, BacktestReport, BacktestSettings};
use aurumbot::config::AppConfig;
use aurumbot::data::load_bars_json;
use aurumbot::models::BarSeries;
use aurumbot::pattern::DoubleBottomDetector;

#[derive(Parser, Debug)]
#[command(name = "backtest_run", about = "Replay a bar history through the decision core")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "AURUM_CONFIG")]
    config: Option<PathBuf>,

    /// Bar history: JSON array of bars with indicator columns.
    #[arg(long)]
    bars: PathBuf,

    /// Starting equity for the simulated book.
    #[arg(long, default_value_t = 10_000.0)]
    equity: f64,

    /// Bars skipped while indicators warm up.
    #[arg(long, default_value_t = 200)]
    warmup: usize,

    /// Write the full report (decisions + trades) as JSON.
    #[arg(long)]
    output: Option<PathBuf>,
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
        error!("backtest failed: {e:#}");
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
    let bars = load_bars_json(&cli.bars)?;
    let series = BarSeries::new(bars);
    let detector = DoubleBottomDetector::from_config(&config);
    let engine = BacktestEngine::new(config);
    let settings = BacktestSettings {
        initial_equity: cli.equity,
        warmup_bars: cli.warmup,
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation requested");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let report = tokio::task::spawn_blocking(move || {
        engine.run(&series, &detector, &settings, &cancel)
    })
    .await
    .context("backtest task panicked")?;

    print_summary(&report);

    if let Some(path) = &cli.output {
        std::fs::write(path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("writing report to {}", path.display()))?;
        info!(file = %path.display(), "full report written");
    }
    Ok(())
}

fn print_summary(report: &BacktestReport) {
    let stats = &report.statistics;
    println!("bars evaluated:   {}", report.bars_evaluated);
    println!("decisions:        {}", report.decisions.len());
    println!(
        "entries allowed:  {}",
        report.decisions.iter().filter(|d| d.allowed()).count()
    );
    println!("trades closed:    {}", stats.total_trades);
    println!("win rate:         {:.1}%", stats.win_rate);
    println!("profit factor:    {:.2}", stats.profit_factor);
    println!("average win:      {:.2}", stats.average_win);
    println!("average loss:     {:.2}", stats.average_loss);
    println!("net profit:       {:.2}", stats.total_profit);
    println!(
        "equity:           {:.2} -> {:.2}",
        report.initial_equity, report.final_equity
    );
    if report.cancelled {
        println!("note: run was cancelled before the end of history");
    }
}
