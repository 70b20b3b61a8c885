//! Feedback & Regeneration Loop (C8)
//!
//! Batches settled-bet outcomes per strategy, summarizes them into a real
//! `BacktestResult` (the same computation the offline backtest binary runs),
//! submits it to the scorer, and consumes regenerated strategy candidates.
//! A candidate only auto-promotes when this cycle's freshly computed
//! backtest clears both the composite-score floor and a minimum sample
//! size — never from a function of the candidate's own proposed
//! parameters. Aggregated stats use `statrs::statistics::Statistics`
//! directly on the feature slices, the same pattern this pack's
//! backtesting service uses for return statistics.

use crate::cache::PredictionCache;
use crate::models::{BacktestResult, Bet, Strategy};
use crate::scorer::{GenerateStrategyRequest, ScorerClient, SubmitFeedbackRequest};
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use statrs::statistics::Statistics;
use std::collections::HashMap;
use tracing::{info, warn};

pub struct FeedbackConfig {
    pub batch_size: usize,
    pub auto_promote_score_floor: f64,
    pub validation_backtest_min_bets: u32,
    pub backtest_lookback: usize,
    pub risk_level: String,
    pub target_return: f64,
    pub max_drawdown_limit: f64,
    pub min_win_rate: f64,
    pub max_candidates: u32,
}

pub struct FeedbackLoop<'a> {
    pub store: &'a Store,
    pub scorer: &'a ScorerClient,
    pub cache: &'a PredictionCache,
    pub config: FeedbackConfig,
}

impl<'a> FeedbackLoop<'a> {
    /// Runs one feedback cycle: gather settled bets since `since` up to the
    /// batch size, group by strategy, submit feedback per strategy, and ask
    /// the scorer to generate new candidates informed by the aggregate.
    pub async fn run_cycle(&self, since: DateTime<Utc>) -> Result<Vec<Strategy>> {
        let bets = self.store.settled_bets_since(since, self.config.batch_size).await?;
        if bets.is_empty() {
            return Ok(Vec::new());
        }

        let mut by_strategy: HashMap<i64, Vec<Bet>> = HashMap::new();
        for bet in bets {
            by_strategy.entry(bet.strategy_id).or_default().push(bet);
        }

        let mut generated = Vec::new();
        for (strategy_id, bets) in by_strategy {
            match self.process_strategy(strategy_id, &bets).await {
                Ok(candidates) => generated.extend(candidates),
                Err(e) => warn!(strategy_id, error = %e, "feedback cycle failed for strategy"),
            }
        }
        Ok(generated)
    }

    async fn process_strategy(&self, strategy_id: i64, bets: &[Bet]) -> Result<Vec<Strategy>> {
        // This cycle's validation backtest: a real `BacktestResult` computed
        // over the settled bets that triggered regeneration, not a proxy of
        // the candidate's own proposed parameters.
        let validation = summarize_bets(strategy_id, bets, "feedback-cycle");
        self.store.insert_backtest_result(&validation).await?;
        let (window_start, window_end) = window_bounds(bets);
        self.store
            .upsert_strategy_performance(
                strategy_id,
                window_start,
                window_end,
                validation.composite_score,
                validation.total_bets,
            )
            .await?;

        let resp = self
            .scorer
            .submit_feedback(&SubmitFeedbackRequest {
                strategy: strategy_id,
                composite: validation.composite_score,
                sharpe: validation.sharpe,
                roi: validation.roi,
                max_drawdown: validation.max_drawdown,
                win_rate: validation.win_rate,
                profit_factor: validation.profit_factor,
                total_bets: validation.total_bets,
                method: validation.method.clone(),
                ml_features: validation.ml_features.clone(),
            })
            .await?;
        if !resp.accepted {
            warn!(strategy_id, "scorer declined feedback batch");
            return Ok(Vec::new());
        }
        // Predictions computed under a superseded model are no longer
        // representative once feedback has been incorporated.
        self.cache.invalidate_strategy(strategy_id);

        let recent = self
            .store
            .recent_backtest_results(strategy_id, self.config.backtest_lookback)
            .await?;
        let aggregated_features = aggregate_backtest_results(&recent);
        let top_metrics = top_metrics_from(&validation);

        let gen = self
            .scorer
            .generate_strategy(&GenerateStrategyRequest {
                risk_level: self.config.risk_level.clone(),
                target_return: self.config.target_return,
                max_drawdown_limit: self.config.max_drawdown_limit,
                min_win_rate: self.config.min_win_rate,
                max_candidates: self.config.max_candidates,
                aggregated_features,
                top_metrics,
            })
            .await?;

        let mut promoted = Vec::new();
        for mut candidate in gen.strategies {
            candidate.active = false;
            if self.should_auto_promote(&validation) {
                candidate.active = true;
                info!(strategy_id = candidate.id, "auto-promoted regenerated strategy");
            }
            self.store.upsert_strategy(&candidate).await?;
            promoted.push(candidate);
        }

        Ok(promoted)
    }

    /// Gates on the composite-score floor AND the freshly computed
    /// validation backtest having enough settled bets behind it — a strong
    /// Sharpe/win-rate off three bets is noise, not signal.
    fn should_auto_promote(&self, validation: &BacktestResult) -> bool {
        validation.composite_score >= self.config.auto_promote_score_floor
            && validation.total_bets >= self.config.validation_backtest_min_bets
    }
}

/// Summarizes settled bets into a `BacktestResult`. Shared between the
/// online feedback loop and the offline backtest binary so both compute the
/// composite score the same way.
pub fn summarize_bets(strategy_id: i64, bets: &[Bet], method: &str) -> BacktestResult {
    let total_bets = bets.len() as u32;
    let pnls: Vec<f64> = bets.iter().map(|b| b.pnl.unwrap_or(0.0)).collect();
    let stakes: Vec<f64> = bets.iter().map(|b| b.stake).collect();

    let wins = pnls.iter().filter(|&&p| p > 0.0).count();
    let win_rate = if total_bets == 0 { 0.0 } else { wins as f64 / total_bets as f64 };

    let total_stake: f64 = stakes.iter().sum();
    let total_pnl: f64 = pnls.iter().sum();
    let roi = if total_stake > 0.0 { total_pnl / total_stake } else { 0.0 };

    let gross_profit: f64 = pnls.iter().filter(|&&p| p > 0.0).sum();
    let gross_loss: f64 = pnls.iter().filter(|&&p| p < 0.0).map(|p| p.abs()).sum();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };

    let sharpe = if pnls.len() > 1 {
        let std = (&pnls[..]).std_dev();
        if std > 1e-9 { (&pnls[..]).mean() / std } else { 0.0 }
    } else {
        0.0
    };

    let mut cumulative = 0.0;
    let mut peak: f64 = 0.0;
    let mut max_drawdown: f64 = 0.0;
    for pnl in &pnls {
        cumulative += pnl;
        peak = peak.max(cumulative);
        if peak > 0.0 {
            max_drawdown = max_drawdown.max((peak - cumulative) / peak);
        }
    }

    // Weighted composite over Sharpe / win rate / drawdown.
    let composite_score = 0.4 * sharpe + 0.3 * win_rate - 0.2 * max_drawdown;

    BacktestResult {
        id: 0,
        strategy_id,
        composite_score,
        sharpe,
        roi,
        max_drawdown,
        win_rate,
        profit_factor,
        total_bets,
        method: method.to_string(),
        ml_features: aggregate_features(bets),
        created_at: Utc::now(),
    }
}

fn window_bounds(bets: &[Bet]) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut start: Option<DateTime<Utc>> = None;
    let mut end: Option<DateTime<Utc>> = None;
    for bet in bets {
        let t = bet.settled_at.unwrap_or(bet.placed_at);
        start = Some(start.map_or(t, |s| s.min(t)));
        end = Some(end.map_or(t, |e| e.max(t)));
    }
    (start.unwrap_or_else(Utc::now), end.unwrap_or_else(Utc::now))
}

/// Per-feature mean/std/min/max across this cycle's settled bets, attached
/// to the `BacktestResult` as `ml_features`.
fn aggregate_features(bets: &[Bet]) -> HashMap<String, f64> {
    let stakes: Vec<f64> = bets.iter().map(|b| b.stake).collect();
    let pnls: Vec<f64> = bets.iter().map(|b| b.pnl.unwrap_or(0.0)).collect();

    let mut out = HashMap::new();
    insert_stats(&mut out, "stake", &stakes);
    insert_stats(&mut out, "pnl", &pnls);
    out
}

/// Mean/std/min/max of each metric across the strategy's last N
/// `BacktestResult`s, rather than over raw per-bet stake/pnl — this is the
/// signal the scorer's generate-strategy endpoint actually wants: how the
/// strategy has performed across recent evaluation windows.
fn aggregate_backtest_results(results: &[BacktestResult]) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    insert_stats(&mut out, "composite_score", &collect(results, |r| r.composite_score));
    insert_stats(&mut out, "sharpe", &collect(results, |r| r.sharpe));
    insert_stats(&mut out, "roi", &collect(results, |r| r.roi));
    insert_stats(&mut out, "max_drawdown", &collect(results, |r| r.max_drawdown));
    insert_stats(&mut out, "win_rate", &collect(results, |r| r.win_rate));
    insert_stats(&mut out, "profit_factor", &collect(results, |r| r.profit_factor));
    out
}

fn collect(results: &[BacktestResult], f: impl Fn(&BacktestResult) -> f64) -> Vec<f64> {
    results.iter().map(f).collect()
}

fn top_metrics_from(result: &BacktestResult) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    out.insert("composite_score".to_string(), result.composite_score);
    out.insert("sharpe".to_string(), result.sharpe);
    out.insert("roi".to_string(), result.roi);
    out.insert("max_drawdown".to_string(), result.max_drawdown);
    out.insert("win_rate".to_string(), result.win_rate);
    out.insert("profit_factor".to_string(), result.profit_factor);
    out.insert("total_bets".to_string(), result.total_bets as f64);
    out
}

fn insert_stats(out: &mut HashMap<String, f64>, name: &str, values: &[f64]) {
    if values.is_empty() {
        return;
    }
    out.insert(format!("{name}_mean"), (&values[..]).mean());
    out.insert(format!("{name}_std"), (&values[..]).std_dev());
    out.insert(
        format!("{name}_min"),
        values.iter().cloned().fold(f64::INFINITY, f64::min),
    );
    out.insert(
        format!("{name}_max"),
        values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BetStatus, Side};

    fn settled_bet(id: i64, strategy_id: i64, pnl: f64, stake: f64) -> Bet {
        Bet {
            id,
            race_id: 1,
            runner_id: 1,
            strategy_id,
            side: Side::Back,
            requested_odds: 3.0,
            stake,
            status: BetStatus::Settled,
            matched_size: stake,
            matched_price: Some(3.0),
            placed_at: Utc::now(),
            matched_at: Some(Utc::now()),
            cancelled_at: None,
            settled_at: Some(Utc::now()),
            pnl: Some(pnl),
            commission: Some(0.0),
            exchange_bet_id: Some("x1".into()),
            exchange_market_id: Some("m1".into()),
            idempotency_token: format!("tok-{id}"),
        }
    }

    #[test]
    fn aggregate_features_computes_mean_and_bounds() {
        let bets = vec![
            settled_bet(1, 1, 10.0, 5.0),
            settled_bet(2, 1, -4.0, 5.0),
            settled_bet(3, 1, 6.0, 5.0),
        ];
        let features = aggregate_features(&bets);
        assert_eq!(features["stake_mean"], 5.0);
        assert_eq!(features["pnl_min"], -4.0);
        assert_eq!(features["pnl_max"], 10.0);
        assert!((features["pnl_mean"] - 4.0).abs() < 1e-9);
    }

    #[test]
    fn summarize_bets_computes_composite_from_real_outcomes() {
        let bets = vec![
            settled_bet(1, 7, 10.0, 5.0),
            settled_bet(2, 7, -4.0, 5.0),
            settled_bet(3, 7, 6.0, 5.0),
        ];
        let result = summarize_bets(7, &bets, "feedback-cycle");
        assert_eq!(result.strategy_id, 7);
        assert_eq!(result.total_bets, 3);
        assert!((result.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((result.roi - (12.0 / 15.0)).abs() < 1e-9);
        assert!(result.profit_factor > 0.0);
    }

    #[test]
    fn should_auto_promote_requires_floor_and_minimum_sample() {
        let loop_ = FeedbackLoop {
            store: &Store::open_in_memory().unwrap(),
            scorer: &ScorerClient::new("http://localhost:1".into(), 100, 1),
            cache: &PredictionCache::new(std::time::Duration::from_secs(60), 10),
            config: FeedbackConfig {
                batch_size: 100,
                auto_promote_score_floor: 0.2,
                validation_backtest_min_bets: 10,
                backtest_lookback: 5,
                risk_level: "moderate".into(),
                target_return: 0.1,
                max_drawdown_limit: 0.2,
                min_win_rate: 0.5,
                max_candidates: 3,
            },
        };

        let strong_but_small_sample = BacktestResult {
            id: 0,
            strategy_id: 1,
            composite_score: 0.9,
            sharpe: 2.0,
            roi: 0.3,
            max_drawdown: 0.05,
            win_rate: 0.8,
            profit_factor: 3.0,
            total_bets: 4,
            method: "feedback-cycle".into(),
            ml_features: HashMap::new(),
            created_at: Utc::now(),
        };
        assert!(!loop_.should_auto_promote(&strong_but_small_sample));

        let below_floor = BacktestResult {
            total_bets: 50,
            composite_score: 0.1,
            ..strong_but_small_sample.clone()
        };
        assert!(!loop_.should_auto_promote(&below_floor));

        let promotable = BacktestResult {
            total_bets: 50,
            composite_score: 0.9,
            ..strong_but_small_sample
        };
        assert!(loop_.should_auto_promote(&promotable));
    }
}
