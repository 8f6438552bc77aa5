//! tradesig: trading signal engine command-line driver
//!
//! Usage:
//!   tradesig signals --bars bars.json                  # Combined signals for a bar file
//!   tradesig backtest --bars bars.json --ticker EURUSD  # Simulate and report
//!   tradesig fetch --symbol BTCUSDT --interval 1h --out bars.json
//!   tradesig explain --bars bars.json --last 3         # Explain recent decisive bars
//!   tradesig strategies --bars bars.json               # Per-strategy vote counts

use std::path::{Path, PathBuf};

use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use engine::{
    build_frame, evaluate_all_strategies, explain_signal, run_backtest, run_signals,
    BacktestReport, BarSource, BinanceClient, Config, JsonFileSource, SignalFrame,
};
use serde::Serialize;
use tracing::info;

const CONFIG_ENV: &str = "TRADESIG_CONFIG";

#[derive(Parser)]
#[command(name = "tradesig")]
#[command(about = "Rule-based trading signals and backtests over OHLCV bars", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Engine configuration (JSON). Falls back to $TRADESIG_CONFIG, then defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate combined signals for a bar file
    Signals {
        /// JSON array of bars
        #[arg(long)]
        bars: PathBuf,
        /// Evaluate only the configured active strategy
        #[arg(long)]
        only_active: bool,
        /// Optional JSON export path
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Run a backtest and print the summary
    Backtest {
        #[arg(long)]
        bars: PathBuf,
        /// Label carried into the report
        #[arg(long, default_value = "UNKNOWN")]
        ticker: String,
        /// Optional JSON export path for the full report
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Download klines from Binance into a bar file
    Fetch {
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1h")]
        interval: String,
        #[arg(long, default_value_t = 1000)]
        limit: usize,
        #[arg(long)]
        out: PathBuf,
    },
    /// Explain the most recent decisive bars
    Explain {
        #[arg(long)]
        bars: PathBuf,
        /// Number of decisive bars to explain
        #[arg(long, default_value_t = 1)]
        last: usize,
    },
    /// Compare every strategy's standalone votes
    Strategies {
        #[arg(long)]
        bars: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,tradesig=debug")
    } else {
        EnvFilter::new("info,engine=info,tradesig=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

/// Explicit path, then the environment, then built-in defaults
fn config_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<Config> {
    match config_path(explicit) {
        Some(path) => {
            info!(path = %path.display(), "Loading config");
            Ok(Config::from_json_file(&path)?)
        }
        None => Ok(Config::default()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    println!("\nExported to {}", path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(cli.config)?;

    match cli.command {
        Commands::Signals {
            bars,
            only_active,
            export,
        } => {
            if only_active {
                config.strategy.combine_strategies = false;
            }
            cmd_signals(&config, &bars, export.as_deref()).await?;
        }
        Commands::Backtest {
            bars,
            ticker,
            export,
        } => {
            cmd_backtest(&config, &bars, &ticker, export.as_deref()).await?;
        }
        Commands::Fetch {
            symbol,
            interval,
            limit,
            out,
        } => {
            cmd_fetch(&symbol, &interval, limit, &out).await?;
        }
        Commands::Explain { bars, last } => {
            cmd_explain(&config, &bars, last).await?;
        }
        Commands::Strategies { bars } => {
            cmd_strategies(&config, &bars).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_signals(config: &Config, bars: &Path, export: Option<&Path>) -> anyhow::Result<()> {
    let bars = JsonFileSource::new(bars).load().await?;
    let signals = run_signals(bars, config)?;

    print_signals(&signals);
    if let Some(path) = export {
        write_json(path, &signals)?;
    }
    Ok(())
}

async fn cmd_backtest(
    config: &Config,
    bars: &Path,
    ticker: &str,
    export: Option<&Path>,
) -> anyhow::Result<()> {
    let bars = JsonFileSource::new(bars).load().await?;
    let result = run_backtest(bars, config)?;
    let report = BacktestReport::build(ticker, &result);

    print_report(&report);
    if let Some(path) = export {
        write_json(path, &report)?;
    }
    Ok(())
}

async fn cmd_fetch(symbol: &str, interval: &str, limit: usize, out: &Path) -> anyhow::Result<()> {
    let client = BinanceClient::new()?;
    let bars = client.fetch_bars(symbol, interval, limit).await?;
    if bars.is_empty() {
        anyhow::bail!("Binance returned no klines for {} {}", symbol, interval);
    }
    println!(
        "Fetched {} {} bars for {} ({} .. {})",
        bars.len(),
        interval,
        symbol,
        bars[0].timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        bars[bars.len() - 1]
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    write_json(out, &bars)
}

async fn cmd_explain(config: &Config, bars: &Path, last: usize) -> anyhow::Result<()> {
    let bars = JsonFileSource::new(bars).load().await?;
    let signals = run_signals(bars, config)?;

    let mut indices: Vec<usize> = signals
        .bars
        .iter()
        .enumerate()
        .filter(|(_, b)| !b.combined.signal.is_neutral())
        .map(|(i, _)| i)
        .collect();
    if indices.is_empty() {
        println!("No decisive bars; explaining the latest bar");
        indices.push(signals.len().saturating_sub(1));
    }
    let start = indices.len().saturating_sub(last.max(1));

    let explanations = indices[start..]
        .iter()
        .map(|&i| explain_signal(&signals, i, config))
        .collect::<Result<Vec<_>, _>>()?;
    println!("{}", serde_json::to_string_pretty(&explanations)?);
    Ok(())
}

async fn cmd_strategies(config: &Config, bars: &Path) -> anyhow::Result<()> {
    let bars = JsonFileSource::new(bars).load().await?;
    let frame = build_frame(bars, config)?;
    let comparisons = evaluate_all_strategies(&frame, config);

    println!("\nStrategy comparison over {} bars:", frame.len());
    println!(
        "  {:<20} {:>8} {:>8} {:>8}  {}",
        "Strategy", "LONG", "SHORT", "NEUTRAL", "Status"
    );
    println!("  {}", "-".repeat(60));
    for c in &comparisons {
        println!(
            "  {:<20} {:>8} {:>8} {:>8}  {}",
            c.kind.to_string(),
            c.counts.long,
            c.counts.short,
            c.counts.neutral,
            c.error.as_deref().unwrap_or("ok")
        );
    }
    Ok(())
}

// ============================================================================
// Output
// ============================================================================

fn print_signals(signals: &SignalFrame) {
    let counts = signals.counts();
    println!(
        "\n=== Signals ({}) | {} bars ===",
        signals.label,
        signals.len()
    );
    println!(
        "LONG: {} | SHORT: {} | NEUTRAL: {} | ties: {}",
        counts.long,
        counts.short,
        counts.neutral,
        signals.ties()
    );
    if !signals.failed_strategies.is_empty() {
        let failed: Vec<String> = signals
            .failed_strategies
            .iter()
            .map(|k| k.to_string())
            .collect();
        println!("Failed strategies (voted neutral): {}", failed.join(", "));
    }

    let decisive: Vec<_> = signals.decisive().collect();
    if decisive.is_empty() {
        println!("\nNo decisive signals.");
        return;
    }

    println!(
        "\n  {:<20} {:<6} {:>6} {:>12} {:>12} {:>12} {:>7}",
        "Time", "Signal", "Score", "Close", "SL", "TP", "L/S/N"
    );
    println!("  {}", "-".repeat(85));
    for bar in decisive {
        let c = &bar.combined;
        println!(
            "  {:<20} {:<6} {:>6.2} {:>12.5} {:>12.5} {:>12.5} {:>7}",
            bar.row.bar.timestamp.format("%Y-%m-%d %H:%M"),
            c.signal.label(),
            c.score,
            bar.row.close(),
            c.stop_loss.unwrap_or(f64::NAN),
            c.take_profit.unwrap_or(f64::NAN),
            format!("{}/{}/{}", c.long_votes, c.short_votes, c.neutral_votes)
        );
    }
}

fn print_report(report: &BacktestReport) {
    let s = &report.summary;
    println!("\n=== Backtest: {} ===", report.ticker);
    println!(
        "Trades: {} ({} won / {} lost) | Win rate: {:.1}%",
        s.total_trades, s.winning_trades, s.losing_trades, s.win_rate
    );
    println!(
        "PnL: {:+.2} ({:+.2}%) | Avg: {:+.2} | Best: {:+.2} | Worst: {:+.2}",
        s.total_pnl, s.total_pnl_pct, s.avg_pnl, s.best_trade, s.worst_trade
    );
    println!(
        "Profit factor: {:.2} | Sharpe: {:.2} | Sortino: {:.2}",
        s.profit_factor, s.sharpe_ratio, s.sortino_ratio
    );
    println!(
        "Max drawdown: {:.2} ({:.2}%) | Return: {:+.2}% | Avg duration: {:.1} min",
        s.max_drawdown, s.max_drawdown_pct, s.cagr, s.avg_duration_minutes
    );
    println!(
        "Equity: {:.2} -> {:.2}",
        s.initial_capital, s.final_equity
    );
}
