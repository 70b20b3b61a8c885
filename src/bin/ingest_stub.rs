//! Ingestion stub
//!
//! Placeholder for the external data-ingestion process referenced in the
//! process topology: periodically writes a synthetic odds snapshot for each
//! scheduled race so the trading binary has something to evaluate against
//! in a development environment. A real feed adapter would replace this
//! entirely; this just exercises the store's append-only write path.

use anyhow::{Context, Result};
use clap::Parser;
use traprunner::models::OddsSnapshot;
use traprunner::store::Store;

#[derive(Parser, Debug)]
#[command(name = "ingest-stub", version, about = "Synthetic odds feed for local development")]
struct Args {
    #[arg(long)]
    db: String,

    #[arg(long, default_value_t = 5)]
    interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    traprunner::logging::init_tracing(false);

    let store = Store::open(&args.db).context("opening store")?;
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(args.interval_secs));

    loop {
        tick.tick().await;
        let now = chrono::Utc::now();
        let races = store
            .races_due_between(now, now + chrono::Duration::hours(1))
            .await?;
        let race_count = races.len();
        for race in races {
            let runners = store.runners_for_race(race.id).await?;
            for runner in runners {
                let back_price = 2.0 + (runner.trap as f64) * 0.3;
                store
                    .insert_odds_snapshot(&OddsSnapshot {
                        ts: now,
                        race_id: race.id,
                        runner_id: runner.id,
                        back_price: Some(back_price),
                        lay_price: Some(back_price + 0.1),
                        back_depth: Some(50.0),
                        lay_depth: Some(50.0),
                        last_traded_price: Some(back_price),
                    })
                    .await?;
            }
        }
        tracing::info!(count = race_count, "ingested synthetic odds tick");
    }
}
