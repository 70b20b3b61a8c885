//! Circuit Breaker (C6)
//!
//! Generalizes this codebase's existing drawdown-throttle idea (a single
//! boolean flag derived from equity peak/trough) into the full
//! closed/open/half-open state machine spec'd for trading, driven off
//! values read from the Risk Ledger snapshot plus exchange error counts.

pub use crate::models::CircuitState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
pub struct CircuitConfig {
    pub max_daily_loss: f64,
    pub max_exposure: f64,
    pub consecutive_error_threshold: u32,
    pub cooldown: chrono::Duration,
}

struct Inner {
    state: CircuitState,
    consecutive_errors: u32,
    opened_at: Option<DateTime<Utc>>,
    half_open_trial_outcome_pending: bool,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<Inner>,
}

pub enum TripReason {
    DailyLoss,
    Exposure,
    ConsecutiveErrors,
    EmergencyShutdown,
}

impl TripReason {
    fn as_str(&self) -> &'static str {
        match self {
            TripReason::DailyLoss => "daily_loss",
            TripReason::Exposure => "exposure",
            TripReason::ConsecutiveErrors => "consecutive_errors",
            TripReason::EmergencyShutdown => "emergency_shutdown",
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_errors: 0,
                opened_at: None,
                half_open_trial_outcome_pending: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Evaluate trip conditions against a fresh risk snapshot. Returns the
    /// reason if a transition to `open` occurred.
    pub fn observe_risk(&self, daily_pnl: f64, exposure: f64, now: DateTime<Utc>) -> Option<&'static str> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            return None;
        }
        if daily_pnl <= -self.config.max_daily_loss {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            return Some(TripReason::DailyLoss.as_str());
        }
        if exposure >= self.config.max_exposure {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            return Some(TripReason::Exposure.as_str());
        }
        None
    }

    pub fn record_exchange_error(&self, now: DateTime<Utc>) -> Option<&'static str> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            // A failure during the half-open trial re-opens immediately.
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            inner.consecutive_errors = 0;
            return Some(TripReason::ConsecutiveErrors.as_str());
        }
        inner.consecutive_errors += 1;
        if inner.consecutive_errors >= self.config.consecutive_error_threshold
            && inner.state == CircuitState::Closed
        {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            return Some(TripReason::ConsecutiveErrors.as_str());
        }
        None
    }

    pub fn record_exchange_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_errors = 0;
        if inner.state == CircuitState::HalfOpen {
            // Half-open must observe a fully-settled successful wager before
            // closing; that confirmation comes via `confirm_half_open_trial`,
            // not a bare exchange ack.
        }
    }

    pub fn emergency_shutdown(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
    }

    /// Called by the scheduler tick: once cool-down has elapsed on an open
    /// circuit, allow a single trial placement by moving to half-open.
    pub fn tick(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if now - opened_at >= self.config.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_trial_outcome_pending = false;
                }
            }
        }
    }

    /// Whether a new placement may be attempted right now. In half-open,
    /// only a single trial is permitted until its outcome is known.
    pub fn may_place(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_trial_outcome_pending {
                    false
                } else {
                    inner.half_open_trial_outcome_pending = true;
                    true
                }
            }
        }
    }

    /// Resolve the outcome of the half-open trial wager once it has fully
    /// settled. Success closes the circuit; failure re-opens it.
    pub fn confirm_half_open_trial(&self, won_or_settled_cleanly: bool, now: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::HalfOpen {
            return;
        }
        if won_or_settled_cleanly {
            inner.state = CircuitState::Closed;
            inner.consecutive_errors = 0;
        } else {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
        inner.half_open_trial_outcome_pending = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb() -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            max_daily_loss: 100.0,
            max_exposure: 500.0,
            consecutive_error_threshold: 3,
            cooldown: chrono::Duration::seconds(60),
        })
    }

    #[test]
    fn trips_on_daily_loss() {
        let b = cb();
        let now = Utc::now();
        assert!(b.observe_risk(-50.0, 0.0, now).is_none());
        assert_eq!(b.observe_risk(-105.0, 0.0, now), Some("daily_loss"));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.may_place());
    }

    #[test]
    fn half_open_single_trial_then_close_on_success() {
        let b = cb();
        let now = Utc::now();
        b.observe_risk(-105.0, 0.0, now);
        b.tick(now + chrono::Duration::seconds(61));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(b.may_place());
        assert!(!b.may_place(), "only one trial permitted per cool-down window");
        b.confirm_half_open_trial(true, now);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_failed_trial() {
        let b = cb();
        let now = Utc::now();
        b.observe_risk(-105.0, 0.0, now);
        b.tick(now + chrono::Duration::seconds(61));
        assert!(b.may_place());
        b.confirm_half_open_trial(false, now);
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[test]
    fn consecutive_errors_trip_circuit() {
        let b = cb();
        let now = Utc::now();
        assert!(b.record_exchange_error(now).is_none());
        assert!(b.record_exchange_error(now).is_none());
        assert_eq!(b.record_exchange_error(now), Some("consecutive_errors"));
    }
}
