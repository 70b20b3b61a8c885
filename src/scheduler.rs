//! Scheduler/Dispatcher (C7)
//!
//! Drives periodic strategy evaluation across upcoming races. Maintains a
//! priority queue keyed on `scheduled_start - pre_race_window`; each tick
//! dequeues due races and fans each `(race, strategy)` unit of work out to
//! an `eval_concurrency`-bounded pool, the same selection-then-bounded-fanout
//! shape as this codebase's per-tick scheduler, adapted from DRR-fairness
//! selection to a fixed evaluation-concurrency cap. Evaluation for the
//! strategies within one race runs concurrently; conflict resolution and
//! placement for that race are serialized afterward so two strategies can
//! never both claim the same runner.

use crate::cache::PredictionCache;
use crate::circuit::CircuitBreaker;
use crate::clock::Clock;
use crate::evaluator::{resolve_conflicts, EvaluationInput, Evaluator};
use crate::exchange::ExchangeClient;
use crate::logging::Loggers;
use crate::metrics::Metrics;
use crate::orders::OrderManager;
use crate::risk::RiskLedger;
use crate::scorer::ScorerClient;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct DueRace {
    dispatch_at: DateTime<Utc>,
    race_id: i64,
}

impl Ord for DueRace {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse so BinaryHeap (a max-heap) pops the earliest dispatch time.
        other.dispatch_at.cmp(&self.dispatch_at)
    }
}

impl PartialOrd for DueRace {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

pub struct SchedulerConfig {
    pub pre_race_window: chrono::Duration,
    pub min_time_to_start_cutoff: chrono::Duration,
    pub eval_concurrency: usize,
    pub model_version: String,
}

pub struct Scheduler<'a> {
    pub store: &'a Store,
    pub risk: &'a RiskLedger,
    pub circuit: &'a CircuitBreaker,
    pub cache: &'a PredictionCache,
    pub scorer: &'a ScorerClient,
    pub exchange: &'a ExchangeClient,
    pub orders: &'a OrderManager<'a>,
    pub loggers: &'a Loggers,
    pub metrics: &'a Metrics,
    pub clock: Arc<dyn Clock>,
    pub config: SchedulerConfig,
}

impl<'a> Scheduler<'a> {
    /// Runs a single tick: load due races within the pre-race window and
    /// fan every `(race, strategy)` pair out across the bounded pool. The
    /// outer fan-out is over races, the inner fan-out over that race's
    /// active strategies; each race's winners are placed once all of that
    /// race's strategies have finished evaluating. Returns the number of
    /// signals placed.
    pub async fn tick(&self) -> Result<usize> {
        if self.circuit.state() == crate::models::CircuitState::Open {
            // Fully open: no placement could survive `OrderManager::place`'s
            // own gate, so skip the scorer/exchange round-trips entirely.
            return Ok(0);
        }

        let now = self.clock.now();
        let horizon = now + self.config.pre_race_window;
        let races = self.store.races_due_between(now, horizon).await?;

        let strategies = self.store.active_strategies().await?;
        if strategies.is_empty() {
            return Ok(0);
        }

        let mut queue: BinaryHeap<DueRace> = races
            .iter()
            .map(|r| DueRace {
                dispatch_at: r.scheduled_start - self.config.pre_race_window,
                race_id: r.id,
            })
            .collect();

        let mut due = Vec::with_capacity(queue.len());
        while let Some(d) = queue.pop() {
            due.push(d);
        }
        let concurrency = self.config.eval_concurrency.max(1);

        let placed: Vec<usize> = stream::iter(due.into_iter().filter(|d| {
            races
                .iter()
                .find(|r| r.id == d.race_id)
                .map(|r| r.scheduled_start - now >= self.config.min_time_to_start_cutoff)
                .unwrap_or(false)
        }))
        .map(|d| self.evaluate_and_place_race(d.race_id, now, &strategies, concurrency))
        .buffer_unordered(concurrency)
        .collect::<Vec<Result<usize>>>()
        .await
        .into_iter()
        .filter_map(|r| match r {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "race evaluation failed");
                None
            }
        })
        .collect();

        Ok(placed.into_iter().sum())
    }

    /// Evaluates every active strategy against one race concurrently (the
    /// per-(race,strategy) unit of work), then resolves conflicts and places
    /// the winners once all of this race's strategies have reported in.
    async fn evaluate_and_place_race(
        &self,
        race_id: i64,
        now: DateTime<Utc>,
        strategies: &[crate::models::Strategy],
        concurrency: usize,
    ) -> Result<usize> {
        let runners = self.store.runners_for_race(race_id).await?;
        let odds_history = self.store.latest_odds_as_of(race_id, now).await?;
        let risk_snapshot = self.risk.snapshot();
        let evaluator = Evaluator::new(self.cache, self.scorer, self.loggers, self.metrics);

        let per_strategy: Vec<Vec<crate::models::Signal>> = stream::iter(strategies.iter())
            .map(|strategy| {
                let input = EvaluationInput {
                    race_id,
                    runners: &runners,
                    odds_history: &odds_history,
                    strategy,
                    evaluation_time: now,
                    model_version: &self.config.model_version,
                    bankroll: risk_snapshot.bankroll,
                };
                let evaluator = &evaluator;
                async move {
                    match evaluator.evaluate(&input).await {
                        Ok(s) => s,
                        Err(e) => {
                            warn!(race_id, strategy_id = strategy.id, error = %e, "evaluation failed");
                            Vec::new()
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let signals: Vec<crate::models::Signal> = per_strategy.into_iter().flatten().collect();
        let winners = resolve_conflicts(signals);
        let markets = self.exchange.list_markets(race_id).await.unwrap_or_default();

        let mut placed = 0;
        for signal in winners {
            let Some(market) = markets.iter().find(|m| m.runner_id == signal.runner_id) else {
                continue;
            };
            match self.orders.place(&signal, &market.market_id, now).await {
                Ok(bet) => {
                    info!(race_id, bet_id = bet.id, "signal placed");
                    placed += 1;
                }
                Err(e) => warn!(race_id, strategy_id = signal.strategy_id, error = %e, "placement failed"),
            }
        }
        Ok(placed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_race_heap_pops_earliest_dispatch_first() {
        let t0 = Utc::now();
        let mut heap: BinaryHeap<DueRace> = BinaryHeap::new();
        heap.push(DueRace {
            dispatch_at: t0 + chrono::Duration::seconds(30),
            race_id: 2,
        });
        heap.push(DueRace {
            dispatch_at: t0,
            race_id: 1,
        });
        heap.push(DueRace {
            dispatch_at: t0 + chrono::Duration::seconds(10),
            race_id: 3,
        });
        assert_eq!(heap.pop().unwrap().race_id, 1);
        assert_eq!(heap.pop().unwrap().race_id, 3);
        assert_eq!(heap.pop().unwrap().race_id, 2);
    }
}
