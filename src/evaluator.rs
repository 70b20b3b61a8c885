//! Strategy Evaluator (C4)
//!
//! For one race and one strategy at one evaluation instant, runs that
//! strategy over the runner field and emits zero-or-more `Signal`s. Pulls
//! probabilities through the prediction cache (C2), falling back to the
//! scorer client (C3) on a miss. Runs once per `(race, strategy)` unit of
//! work so the scheduler can fan these out independently.

use crate::cache::{Fingerprint, PredictionCache, PredictionResult};
use crate::kelly::fractional_kelly;
use crate::logging::Loggers;
use crate::metrics::Metrics;
use crate::models::{OddsSnapshot, Runner, Side, Signal, Strategy};
use crate::scorer::{PredictRequest, ScorerClient};
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

pub struct EvaluationInput<'a> {
    pub race_id: i64,
    pub runners: &'a [Runner],
    pub odds_history: &'a [OddsSnapshot],
    pub strategy: &'a Strategy,
    pub evaluation_time: DateTime<Utc>,
    pub model_version: &'a str,
    /// Bankroll as of `evaluation_time`, read from the Risk Ledger snapshot;
    /// the ledger itself remains the authoritative budget gate applied to
    /// the emitted signal's reservation.
    pub bankroll: f64,
}

pub struct Evaluator<'a> {
    pub cache: &'a PredictionCache,
    pub scorer: &'a ScorerClient,
    pub loggers: &'a Loggers,
    pub metrics: &'a Metrics,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        cache: &'a PredictionCache,
        scorer: &'a ScorerClient,
        loggers: &'a Loggers,
        metrics: &'a Metrics,
    ) -> Self {
        Self { cache, scorer, loggers, metrics }
    }

    pub async fn evaluate(&self, input: &EvaluationInput<'a>) -> Result<Vec<Signal>> {
        // Temporal safety (I4): reject any snapshot after evaluation_time
        // before it can influence a decision.
        if input
            .odds_history
            .iter()
            .any(|s| s.ts > input.evaluation_time)
        {
            bail!("odds snapshot timestamped after evaluation time");
        }

        let strategy = input.strategy;
        if !strategy.active {
            return Ok(Vec::new());
        }

        let latest_odds = latest_odds_by_runner(input.odds_history, input.evaluation_time);

        let mut signals = Vec::new();
        for runner in input.runners {
            let Some(snap) = latest_odds.get(&runner.id) else {
                continue;
            };

            if let Some(min_liquidity) = strategy.params.min_liquidity {
                let back_ok = snap.back_depth.unwrap_or(0.0) >= min_liquidity;
                let lay_ok = snap.lay_depth.unwrap_or(0.0) >= min_liquidity;
                if !back_ok && !lay_ok {
                    self.reject(strategy, input.race_id, runner.id, "insufficient_liquidity");
                    continue;
                }
            }

            let Some(odds) = snap.back_price else {
                self.reject(strategy, input.race_id, runner.id, "no_back_price");
                continue;
            };
            if odds < strategy.params.min_odds || odds > strategy.params.max_odds {
                self.reject(strategy, input.race_id, runner.id, "odds_out_of_range");
                continue;
            }

            let probability = match self.probability(input, strategy, runner).await {
                Ok(p) => p,
                Err(_) => {
                    self.reject(strategy, input.race_id, runner.id, "scorer_unavailable");
                    continue;
                }
            };
            let Some(p) = normalize_probability(probability) else {
                self.reject(strategy, input.race_id, runner.id, "probability_not_finite");
                continue;
            };

            let edge = p * odds - 1.0;
            if edge <= strategy.params.min_edge || p < strategy.params.min_confidence {
                self.reject(strategy, input.race_id, runner.id, "edge_or_confidence_below_floor");
                continue;
            }

            let kelly = fractional_kelly(
                p,
                odds,
                strategy.params.kelly_fraction,
                input.bankroll,
                strategy.params.max_stake_per_bet,
                strategy.params.min_stake,
            );
            if kelly.stake <= 0.0 {
                self.reject(strategy, input.race_id, runner.id, "kelly_stake_non_positive");
                continue;
            }

            let expected_value = p * (odds - 1.0) * kelly.stake - (1.0 - p) * kelly.stake;
            if expected_value <= 0.0 {
                self.reject(strategy, input.race_id, runner.id, "non_positive_expected_value");
                continue;
            }

            self.loggers.strategy.signal_emitted(
                &strategy.name,
                input.race_id,
                runner.id,
                "back",
                odds,
                kelly.stake,
                edge,
                p,
            );
            self.metrics.record_signal_emitted(strategy.id);

            signals.push(Signal {
                race_id: input.race_id,
                runner_id: runner.id,
                strategy_id: strategy.id,
                side: Side::Back,
                target_odds: odds,
                stake: kelly.stake,
                probability: p,
                expected_value,
                reasoning: format!(
                    "edge={:.4} p={:.4} odds={:.2} kelly_fraction={:.2}",
                    edge, p, odds, strategy.params.kelly_fraction
                ),
            });
        }

        Ok(signals)
    }

    fn reject(&self, strategy: &Strategy, race_id: i64, runner_id: i64, reason: &'static str) {
        self.loggers.strategy.signal_rejected(&strategy.name, race_id, runner_id, reason);
        self.metrics.record_signal_rejected(strategy.id, reason);
    }

    async fn probability(
        &self,
        input: &EvaluationInput<'_>,
        strategy: &Strategy,
        runner: &Runner,
    ) -> Result<f64> {
        let fp = Fingerprint {
            race_id: input.race_id,
            runner_id: runner.id,
            strategy_id: strategy.id,
            model_version: input.model_version.to_string(),
        };
        let scorer = self.scorer;
        let race_id = input.race_id;
        let strategy_id = strategy.id;
        let runner_id = runner.id;
        let cached = self.cache.get(&fp).is_some();
        let result: PredictionResult = self
            .cache
            .get_or_compute(fp, || async move {
                let resp = scorer
                    .predict(&PredictRequest {
                        race_id,
                        runner_id,
                        strategy_id,
                        features: HashMap::new(),
                    })
                    .await?;
                Ok(PredictionResult {
                    probability: resp.probability,
                    confidence: resp.confidence,
                    model_version: resp.model_version,
                })
            })
            .await?;
        self.loggers.ml.prediction(race_id, runner_id, &strategy.name, result.probability, cached);
        Ok(result.probability)
    }
}

fn latest_odds_by_runner(
    history: &[OddsSnapshot],
    as_of: DateTime<Utc>,
) -> HashMap<i64, &OddsSnapshot> {
    let mut latest: HashMap<i64, &OddsSnapshot> = HashMap::new();
    for snap in history.iter().filter(|s| s.ts <= as_of) {
        latest
            .entry(snap.runner_id)
            .and_modify(|cur| {
                if snap.ts > cur.ts {
                    *cur = snap;
                }
            })
            .or_insert(snap);
    }
    latest
}

/// Clamps to [0,1] and rejects NaN/infinite probabilities (spec §4.4 step 3).
fn normalize_probability(p: f64) -> Option<f64> {
    if !p.is_finite() {
        return None;
    }
    Some(p.clamp(0.0, 1.0))
}

/// Resolves a race's candidate signals when multiple strategies pick the
/// same runner: highest expected value wins, ties broken by strategy id
/// ascending (spec §4.4).
pub fn resolve_conflicts(signals: Vec<Signal>) -> Vec<Signal> {
    let mut by_runner: HashMap<i64, Signal> = HashMap::new();
    for signal in signals {
        by_runner
            .entry(signal.runner_id)
            .and_modify(|cur| {
                if signal.expected_value > cur.expected_value
                    || (signal.expected_value == cur.expected_value
                        && signal.strategy_id < cur.strategy_id)
                {
                    *cur = signal.clone();
                }
            })
            .or_insert(signal);
    }
    let mut out: Vec<Signal> = by_runner.into_values().collect();
    out.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(runner_id: i64, strategy_id: i64, ev: f64) -> Signal {
        Signal {
            race_id: 1,
            runner_id,
            strategy_id,
            side: Side::Back,
            target_odds: 3.0,
            stake: 10.0,
            probability: 0.4,
            expected_value: ev,
            reasoning: String::new(),
        }
    }

    #[test]
    fn normalize_rejects_nan_and_infinite() {
        assert_eq!(normalize_probability(f64::NAN), None);
        assert_eq!(normalize_probability(f64::INFINITY), None);
        assert_eq!(normalize_probability(1.5), Some(1.0));
        assert_eq!(normalize_probability(-0.2), Some(0.0));
    }

    #[test]
    fn latest_odds_respects_temporal_cutoff() {
        let t0 = Utc::now();
        let history = vec![
            OddsSnapshot {
                ts: t0,
                race_id: 1,
                runner_id: 1,
                back_price: Some(3.0),
                lay_price: None,
                back_depth: None,
                lay_depth: None,
                last_traded_price: None,
            },
            OddsSnapshot {
                ts: t0 + chrono::Duration::seconds(5),
                race_id: 1,
                runner_id: 1,
                back_price: Some(4.0),
                lay_price: None,
                back_depth: None,
                lay_depth: None,
                last_traded_price: None,
            },
        ];
        let latest = latest_odds_by_runner(&history, t0 + chrono::Duration::seconds(1));
        assert_eq!(latest[&1].back_price, Some(3.0));
    }

    // Higher expected value wins; ties broken by strategy id ascending.
    #[test]
    fn conflict_resolution_prefers_higher_ev_then_lower_strategy_id() {
        let resolved = resolve_conflicts(vec![
            signal(1, 5, 2.0),
            signal(1, 2, 2.0),
            signal(1, 9, 5.0),
        ]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].strategy_id, 9);

        let resolved = resolve_conflicts(vec![signal(2, 5, 1.0), signal(2, 2, 1.0)]);
        assert_eq!(resolved[0].strategy_id, 2);
    }
}
