//! Error taxonomy
//!
//! One enum per the failure classes the orchestrator distinguishes at its
//! boundaries. Local operations mostly use `anyhow::Result` the way the
//! adapters in this codebase always have; this enum exists for the handful
//! of call sites (risk gate, scorer client, order placement) where the
//! caller needs to branch on *kind* of failure, not just log it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("transient external failure: {0}")]
    TransientExternal(String),

    #[error("auth expired")]
    AuthExpired,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("data unavailable: {0}")]
    DataUnavailable(String),

    #[error("placement timed out")]
    PlacementTimeout,

    #[error("reconciliation mismatch: {0}")]
    ReconciliationMismatch(String),
}

/// Risk Ledger rejection reasons (spec §4.1).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RiskError {
    #[error("reservation would exceed MaxExposure")]
    BudgetExceeded,
    #[error("daily loss limit reached")]
    DailyLossExceeded,
    #[error("trading paused by circuit breaker")]
    TradingPaused,
}

impl From<RiskError> for OrchestratorError {
    fn from(e: RiskError) -> Self {
        match e {
            RiskError::BudgetExceeded | RiskError::DailyLossExceeded => {
                OrchestratorError::InvariantViolation(e.to_string())
            }
            RiskError::TradingPaused => OrchestratorError::TransientExternal(e.to_string()),
        }
    }
}

/// ML Scorer Client failure modes (spec §4.3).
#[derive(Debug, Error, Clone)]
pub enum ScorerError {
    #[error("scorer unavailable: {0}")]
    ScorerUnavailable(String),
    #[error("scorer returned an invalid response: {0}")]
    ScorerInvalidResponse(String),
    #[error("scorer call timed out")]
    Timeout,
}

impl From<ScorerError> for OrchestratorError {
    fn from(e: ScorerError) -> Self {
        match e {
            ScorerError::ScorerUnavailable(m) => OrchestratorError::TransientExternal(m),
            ScorerError::Timeout => OrchestratorError::TransientExternal("timeout".into()),
            ScorerError::ScorerInvalidResponse(m) => OrchestratorError::InvalidRequest(m),
        }
    }
}
