//! Metrics registry
//!
//! This codebase's `Cargo.toml` already pulled in `metrics` and
//! `metrics-exporter-prometheus` but never wired them to anything; this
//! module is where they actually get used, built once in `main` and passed
//! down like every other collaborator rather than reached through a
//! `lazy_static` recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        Ok(Self { handle })
    }

    /// A recorder that is built but never installed as the process-global
    /// one, so unit tests across this crate can each construct their own
    /// without racing to claim the single global recorder slot.
    #[cfg(test)]
    pub fn for_test() -> Self {
        let (_recorder, handle) = PrometheusBuilder::new()
            .build()
            .expect("building an uninstalled prometheus recorder cannot fail");
        Self { handle }
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn record_signal_emitted(&self, strategy_id: i64) {
        metrics::counter!("signals_emitted_total", "strategy_id" => strategy_id.to_string())
            .increment(1);
    }

    pub fn record_signal_rejected(&self, strategy_id: i64, reason: &'static str) {
        metrics::counter!(
            "signals_rejected_total",
            "strategy_id" => strategy_id.to_string(),
            "reason" => reason,
        )
        .increment(1);
    }

    pub fn record_bet_placed(&self, stake: f64) {
        metrics::counter!("bets_placed_total").increment(1);
        metrics::histogram!("bet_stake").record(stake);
    }

    pub fn record_bet_settled(&self, pnl: f64) {
        metrics::counter!("bets_settled_total").increment(1);
        metrics::histogram!("bet_pnl").record(pnl);
    }

    pub fn set_exposure(&self, exposure: f64) {
        metrics::gauge!("risk_exposure").set(exposure);
    }

    pub fn set_daily_pnl(&self, pnl: f64) {
        metrics::gauge!("risk_daily_pnl").set(pnl);
    }

    pub fn set_circuit_state(&self, state_code: f64) {
        metrics::gauge!("circuit_state").set(state_code);
    }

    pub fn record_scorer_call(&self, outcome: &'static str, latency_ms: f64) {
        metrics::counter!("scorer_calls_total", "outcome" => outcome).increment(1);
        metrics::histogram!("scorer_latency_ms").record(latency_ms);
    }
}
