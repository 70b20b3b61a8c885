//! Named structured logging sinks.
//!
//! The source this was distilled from used ambient, cross-cutting logging
//! flavors (a "strategy log", an "ML log", an "audit log") reached through
//! module-level state. Per the redesign notes we model each as a small
//! struct constructed once in `main` and threaded to whichever component
//! needs it, instead of a global. Each sink is just a fixed `tracing`
//! target; the struct exists so call sites depend on a concrete type
//! rather than reaching for a free function tied to a global subscriber.

use tracing::{field::Empty, info};

#[derive(Debug, Clone, Copy, Default)]
pub struct StrategyLog;

impl StrategyLog {
    pub fn signal_emitted(
        &self,
        strategy: &str,
        race_id: i64,
        runner_id: i64,
        decision: &str,
        odds: f64,
        stake: f64,
        edge: f64,
        confidence: f64,
    ) {
        info!(
            target: "strategy",
            event = "signal_emitted",
            strategy,
            race_id,
            runner_id,
            decision,
            odds,
            stake,
            edge,
            confidence,
        );
    }

    pub fn signal_rejected(&self, strategy: &str, race_id: i64, runner_id: i64, reason: &str) {
        info!(
            target: "strategy",
            event = "signal_rejected",
            strategy,
            race_id,
            runner_id,
            reason,
            decision = Empty,
        );
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MlLog;

impl MlLog {
    pub fn prediction(&self, race_id: i64, runner_id: i64, strategy: &str, probability: f64, cached: bool) {
        info!(
            target: "ml",
            event = "prediction",
            race_id,
            runner_id,
            strategy,
            probability,
            cached,
        );
    }

    pub fn feedback_submitted(&self, strategy: &str, composite: f64, success: bool) {
        info!(target: "ml", event = "feedback_submitted", strategy, composite, success);
    }

    pub fn strategy_generated(&self, count: usize) {
        info!(target: "ml", event = "strategy_generated", count);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditLog;

impl AuditLog {
    pub fn invariant_violation(&self, context: &str, detail: &str) {
        tracing::error!(target: "audit", event = "invariant_violation", context, detail);
    }

    pub fn bet_state_transition(&self, bet_id: i64, market_id: &str, from: &str, to: &str) {
        info!(
            target: "audit",
            event = "bet_state_transition",
            bet_id,
            market_id,
            from,
            to,
        );
    }

    pub fn circuit_state_change(&self, from: &str, to: &str, reason: &str) {
        tracing::warn!(target: "audit", event = "circuit_state_change", from, to, reason);
    }

    pub fn reconciliation_mismatch(&self, bet_id: i64, detail: &str) {
        tracing::error!(target: "audit", event = "reconciliation_mismatch", bet_id, detail);
    }
}

/// Construction-time bundle passed to every component that logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Loggers {
    pub strategy: StrategyLog,
    pub ml: MlLog,
    pub audit: AuditLog,
}

pub fn init_tracing(json: bool) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "traprunner=info,tower_http=info".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
