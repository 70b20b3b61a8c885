//! Backtest CLI
//!
//! Summarizes a strategy's settled bets over `[from, to)` into a
//! `BacktestResult` using the same computation the online feedback loop
//! runs, and persists the row, letting an operator run the exact window a
//! dashboard or an ad-hoc investigation needs outside the feedback cadence.
//!
//! # Exit codes
//! - 0: run completed
//! - 2: configuration error
//! - 3: runtime error

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use traprunner::feedback::summarize_bets;
use traprunner::store::Store;

#[derive(Parser, Debug)]
#[command(name = "backtest", version, about = "Summarize a strategy's settled bets into a BacktestResult")]
struct Args {
    #[arg(long)]
    db: String,

    #[arg(long)]
    strategy_id: i64,

    #[arg(long)]
    from: DateTime<Utc>,

    #[arg(long)]
    to: Option<DateTime<Utc>>,

    #[arg(long, default_value = "manual-backtest")]
    method: String,

    #[arg(long)]
    persist: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match run(args).await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("backtest run failed: {e:#}");
            std::process::exit(3);
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let store = Store::open(&args.db).context("opening store")?;
    let to = args.to.unwrap_or_else(Utc::now);
    if to <= args.from {
        bail!("--to must be after --from");
    }

    let bets = store
        .settled_bets_for_strategy_between(args.strategy_id, args.from, to)
        .await
        .context("loading settled bets")?;
    if bets.is_empty() {
        eprintln!("no settled bets for strategy {} in [{}, {})", args.strategy_id, args.from, to);
        return Ok(());
    }

    let result = summarize_bets(args.strategy_id, &bets, &args.method);
    println!("{}", serde_json::to_string_pretty(&result)?);

    if args.persist {
        let id = store.insert_backtest_result(&result).await.context("persisting backtest result")?;
        eprintln!("persisted backtest_results row {id}");
    }
    Ok(())
}
