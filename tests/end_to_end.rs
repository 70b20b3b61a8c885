//! End-to-end scenario tests.
//!
//! Exercises the evaluator, risk ledger and circuit breaker together the way
//! a live evaluation tick would chain them, without going over the network:
//! the scorer and exchange clients are real `reqwest`-backed types, so these
//! tests pre-seed the prediction cache (bypassing the scorer RPC) and drive
//! the risk/circuit/cache layer directly for the placement-side scenarios.

use chrono::{Duration, Utc};
use traprunner::cache::{Fingerprint, PredictionCache, PredictionResult};
use traprunner::circuit::{CircuitBreaker, CircuitConfig};
use traprunner::evaluator::{EvaluationInput, Evaluator};
use traprunner::logging::Loggers;
use traprunner::metrics::Metrics;
use traprunner::models::{OddsSnapshot, Runner, Side, Strategy, StrategyParams};
use traprunner::risk::{default_day_boundary, RiskLedger};
use traprunner::scorer::ScorerClient;

fn runner() -> Runner {
    Runner {
        id: 1,
        race_id: 1,
        trap: 1,
        name: "Fast Eddie".into(),
        form_rating: None,
        weight_kg: None,
    }
}

fn strategy() -> Strategy {
    Strategy {
        id: 1,
        name: "baseline".into(),
        active: true,
        params: StrategyParams {
            min_edge: 0.02,
            min_confidence: 0.55,
            min_odds: 1.2,
            max_odds: 50.0,
            min_liquidity: Some(10.0),
            kelly_fraction: 0.5,
            max_stake_per_bet: 1000.0,
            min_stake: 1.0,
        },
    }
}

fn odds_snapshot(ts: chrono::DateTime<Utc>) -> OddsSnapshot {
    OddsSnapshot {
        ts,
        race_id: 1,
        runner_id: 1,
        back_price: Some(4.0),
        lay_price: Some(4.2),
        back_depth: Some(50.0),
        lay_depth: Some(50.0),
        last_traded_price: Some(4.0),
    }
}

// Scenario 1: happy path back bet.
#[tokio::test]
async fn scenario_1_happy_path_back_bet() {
    let cache = PredictionCache::new(std::time::Duration::from_secs(60), 10);
    let scorer = ScorerClient::new("http://unused.invalid".into(), 100, 1);
    let now = Utc::now();

    cache.set(
        Fingerprint {
            race_id: 1,
            runner_id: 1,
            strategy_id: 1,
            model_version: "v1".into(),
        },
        PredictionResult {
            probability: 0.30,
            confidence: 0.9,
            model_version: "v1".into(),
        },
    );

    let loggers = Loggers::default();
    let metrics = Metrics::for_test();
    let evaluator = Evaluator::new(&cache, &scorer, &loggers, &metrics);
    let runners = vec![runner()];
    let history = vec![odds_snapshot(now)];
    let active_strategy = strategy();

    let input = EvaluationInput {
        race_id: 1,
        runners: &runners,
        odds_history: &history,
        strategy: &active_strategy,
        evaluation_time: now,
        model_version: "v1",
        bankroll: 1000.0,
    };

    let signals = evaluator.evaluate(&input).await.unwrap();
    assert_eq!(signals.len(), 1);
    let signal = &signals[0];
    assert!((signal.stake - 33.33).abs() < 1.0);
    assert_eq!(signal.side, Side::Back);
    assert!(signal.expected_value > 0.0);

    let risk = RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary());
    let reservation = risk.reserve(signal.stake, 1, 1).unwrap();
    assert_eq!(risk.snapshot().exposure, signal.stake);

    // Settlement: win at odds 4.0 on the full stake.
    let pnl = (4.0 - 1.0) * signal.stake;
    risk.release(reservation, signal.stake, pnl);
    assert_eq!(risk.snapshot().exposure, 0.0);
    assert!(risk.snapshot().daily_pnl > 95.0);
}

// Scenario 2: rejection on low edge.
#[tokio::test]
async fn scenario_2_rejection_on_low_edge() {
    let cache = PredictionCache::new(std::time::Duration::from_secs(60), 10);
    let scorer = ScorerClient::new("http://unused.invalid".into(), 100, 1);
    let now = Utc::now();

    cache.set(
        Fingerprint {
            race_id: 1,
            runner_id: 1,
            strategy_id: 1,
            model_version: "v1".into(),
        },
        PredictionResult {
            probability: 0.24,
            confidence: 0.9,
            model_version: "v1".into(),
        },
    );

    let loggers = Loggers::default();
    let metrics = Metrics::for_test();
    let evaluator = Evaluator::new(&cache, &scorer, &loggers, &metrics);
    let runners = vec![runner()];
    let history = vec![odds_snapshot(now)];
    let active_strategy = strategy();

    let input = EvaluationInput {
        race_id: 1,
        runners: &runners,
        odds_history: &history,
        strategy: &active_strategy,
        evaluation_time: now,
        model_version: "v1",
        bankroll: 1000.0,
    };

    let signals = evaluator.evaluate(&input).await.unwrap();
    assert!(signals.is_empty(), "edge of -0.04 must not emit a signal");
}

// Scenario 3: circuit trip on daily loss.
#[test]
fn scenario_3_circuit_trips_on_daily_loss() {
    let risk = RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary());
    let circuit = CircuitBreaker::new(CircuitConfig {
        max_daily_loss: 100.0,
        max_exposure: 500.0,
        consecutive_error_threshold: 5,
        cooldown: Duration::seconds(300),
    });
    let now = Utc::now();

    for loss in [40.0, 35.0, 30.0] {
        let r = risk.reserve(loss, 1, 1).unwrap();
        risk.release(r, loss, -loss);
        let snap = risk.snapshot();
        if let Some(reason) = circuit.observe_risk(snap.daily_pnl, snap.exposure, now) {
            assert_eq!(reason, "daily_loss");
        }
    }

    assert_eq!(circuit.state(), traprunner::models::CircuitState::Open);
    // The Risk Ledger's own daily-loss gate rejects independently of whether
    // the orchestrator has yet propagated the breaker's state onto it.
    let err = risk.reserve(10.0, 1, 1).unwrap_err();
    assert_eq!(err, traprunner::errors::RiskError::DailyLossExceeded);
}

// Scenario 4: partial fill then timeout releases exactly the unmatched
// remainder, leaving the matched portion's exposure reserved.
#[test]
fn scenario_4_partial_fill_then_timeout_releases_unmatched_only() {
    let risk = RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary());
    let reservation = risk.reserve(20.0, 1, 1).unwrap();
    assert_eq!(risk.snapshot().exposure, 20.0);

    // Exchange matched 8 of 20; timeout cancels the remaining 12.
    let matched = 8.0;
    let unmatched = 20.0 - matched;
    risk.release(reservation, unmatched, 0.0);

    assert_eq!(risk.snapshot().exposure, matched);
}

// Scenario 5: temporal-safety violation.
#[tokio::test]
async fn scenario_5_temporal_safety_violation_rejected() {
    let cache = PredictionCache::new(std::time::Duration::from_secs(60), 10);
    let scorer = ScorerClient::new("http://unused.invalid".into(), 100, 1);
    let now = Utc::now();

    let loggers = Loggers::default();
    let metrics = Metrics::for_test();
    let evaluator = Evaluator::new(&cache, &scorer, &loggers, &metrics);
    let runners = vec![runner()];
    let history = vec![odds_snapshot(now + Duration::seconds(1))];
    let active_strategy = strategy();

    let input = EvaluationInput {
        race_id: 1,
        runners: &runners,
        odds_history: &history,
        strategy: &active_strategy,
        evaluation_time: now,
        model_version: "v1",
        bankroll: 1000.0,
    };

    let result = evaluator.evaluate(&input).await;
    assert!(result.is_err(), "a future-timestamped snapshot must be rejected");
}

// Scenario 6: feedback-driven invalidation.
#[test]
fn scenario_6_feedback_invalidation_clears_cached_predictions() {
    let cache = PredictionCache::new(std::time::Duration::from_secs(60), 10);
    let fp = Fingerprint {
        race_id: 1,
        runner_id: 1,
        strategy_id: 7,
        model_version: "v1".into(),
    };
    cache.set(
        fp.clone(),
        PredictionResult {
            probability: 0.4,
            confidence: 0.8,
            model_version: "v1".into(),
        },
    );
    assert!(cache.get(&fp).is_some());

    cache.invalidate_strategy(7);
    assert!(cache.get(&fp).is_none());
}
