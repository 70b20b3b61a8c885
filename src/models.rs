//! Core data model
//!
//! Race / Runner / OddsSnapshot / Strategy / Signal / Bet / BacktestResult /
//! RiskSnapshot, and the application Config.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Scheduled,
    Open,
    InProgress,
    Closed,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Race {
    pub id: i64,
    pub scheduled_start: DateTime<Utc>,
    pub actual_start: Option<DateTime<Utc>>,
    pub track: String,
    pub distance_m: u32,
    pub status: RaceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: i64,
    pub race_id: i64,
    pub trap: u8,
    pub name: String,
    pub form_rating: Option<f64>,
    pub weight_kg: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Back,
    Lay,
}

/// Append-only, time-indexed. Never contains a timestamp greater than the
/// evaluation time a strategy invocation is run against (I4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub ts: DateTime<Utc>,
    pub race_id: i64,
    pub runner_id: i64,
    pub back_price: Option<f64>,
    pub lay_price: Option<f64>,
    pub back_depth: Option<f64>,
    pub lay_depth: Option<f64>,
    pub last_traded_price: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyParams {
    pub min_edge: f64,
    pub min_confidence: f64,
    pub min_odds: f64,
    pub max_odds: f64,
    pub min_liquidity: Option<f64>,
    pub kelly_fraction: f64,
    pub max_stake_per_bet: f64,
    pub min_stake: f64,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            min_edge: 0.02,
            min_confidence: 0.55,
            min_odds: 1.2,
            max_odds: 50.0,
            min_liquidity: None,
            kelly_fraction: 0.5,
            max_stake_per_bet: 50.0,
            min_stake: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub active: bool,
    pub params: StrategyParams,
}

/// Transient: lives only from evaluator output to dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub race_id: i64,
    pub runner_id: i64,
    pub strategy_id: i64,
    pub side: Side,
    pub target_odds: f64,
    pub stake: f64,
    pub probability: f64,
    pub expected_value: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetStatus {
    Pending,
    Matched,
    PartiallyMatched,
    Cancelled,
    Settled,
    Void,
}

impl BetStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BetStatus::Cancelled | BetStatus::Settled | BetStatus::Void)
    }
}

impl std::fmt::Display for BetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BetStatus::Pending => "pending",
            BetStatus::Matched => "matched",
            BetStatus::PartiallyMatched => "partially_matched",
            BetStatus::Cancelled => "cancelled",
            BetStatus::Settled => "settled",
            BetStatus::Void => "void",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    pub id: i64,
    pub race_id: i64,
    pub runner_id: i64,
    pub strategy_id: i64,
    pub side: Side,
    pub requested_odds: f64,
    pub stake: f64,
    pub status: BetStatus,
    pub matched_size: f64,
    pub matched_price: Option<f64>,
    pub placed_at: DateTime<Utc>,
    pub matched_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
    pub pnl: Option<f64>,
    pub commission: Option<f64>,
    pub exchange_bet_id: Option<String>,
    pub exchange_market_id: Option<String>,
    pub idempotency_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: i64,
    pub strategy_id: i64,
    pub composite_score: f64,
    pub sharpe: f64,
    pub roi: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_bets: u32,
    pub method: String,
    pub ml_features: HashMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub bankroll: f64,
    pub exposure: f64,
    pub daily_pnl: f64,
    pub circuit_state: CircuitState,
    pub day_boundary: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayBoundary {
    Utc,
    Local,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub http_bind: String,
    pub metrics_bind: String,
    pub initial_bankroll: f64,
    pub max_exposure: f64,
    pub max_daily_loss: f64,
    pub day_boundary: DayBoundary,
    pub day_boundary_tz: String,
    pub scorer_base_url: String,
    pub scorer_deadline_ms: u64,
    pub scorer_max_retries: u32,
    pub exchange_base_url: String,
    pub eval_concurrency: usize,
    pub monitor_poll_interval_secs: u64,
    pub pre_race_window_secs: i64,
    pub min_time_to_start_cutoff_secs: i64,
    pub feedback_batch_size: usize,
    pub feedback_interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub circuit_cooldown_secs: u64,
    pub circuit_error_threshold: u32,
    pub placement_timeout_secs: u64,
    pub odds_retention_days: i64,
    pub tracing_enabled: bool,
    pub tracing_collector_addr: Option<String>,
    /// PEM bundle (client cert followed by its key) for mutual-TLS against
    /// the exchange, layered on top of its username/password session auth.
    pub exchange_client_identity_path: Option<String>,
    pub risk_level: String,
    pub target_return: f64,
    pub max_drawdown_limit: f64,
    pub min_win_rate: f64,
    pub max_candidates: u32,
    pub auto_promote_score_floor: f64,
    /// Minimum settled-bet sample size a freshly computed validation
    /// backtest needs before a regenerated strategy can auto-promote.
    pub validation_backtest_min_bets: u32,
    /// How many of a strategy's most recent `BacktestResult`s feed the
    /// aggregated features sent to the scorer's generate-strategy endpoint.
    pub backtest_lookback: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        let day_boundary = match std::env::var("DAY_BOUNDARY").as_deref() {
            Ok("local") | Ok("LOCAL") => DayBoundary::Local,
            _ => DayBoundary::Utc,
        };

        Ok(Self {
            database_path: std::env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "./traprunner.db".to_string()),
            http_bind: std::env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            metrics_bind: std::env::var("METRICS_BIND")
                .unwrap_or_else(|_| "0.0.0.0:9090".to_string()),
            initial_bankroll: env_or("INITIAL_BANKROLL", 10_000.0),
            max_exposure: env_or("MAX_EXPOSURE", 2_000.0),
            max_daily_loss: env_or("MAX_DAILY_LOSS", 500.0),
            day_boundary,
            day_boundary_tz: std::env::var("DAY_BOUNDARY_TZ")
                .unwrap_or_else(|_| "UTC".to_string()),
            scorer_base_url: std::env::var("SCORER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9500".to_string()),
            scorer_deadline_ms: env_or("SCORER_DEADLINE_MS", 2_000),
            scorer_max_retries: env_or("SCORER_MAX_RETRIES", 3),
            exchange_base_url: std::env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://exchange.example.invalid".to_string()),
            eval_concurrency: env_or("EVAL_CONCURRENCY", 8),
            monitor_poll_interval_secs: env_or("MONITOR_POLL_INTERVAL_SECS", 5),
            pre_race_window_secs: env_or("PRE_RACE_WINDOW_SECS", 600),
            min_time_to_start_cutoff_secs: env_or("MIN_TIME_TO_START_CUTOFF_SECS", 30),
            feedback_batch_size: env_or("FEEDBACK_BATCH_SIZE", 200),
            feedback_interval_secs: env_or("FEEDBACK_INTERVAL_SECS", 3_600),
            cache_ttl_secs: env_or("CACHE_TTL_SECS", 60),
            cache_capacity: env_or("CACHE_CAPACITY", 10_000),
            circuit_cooldown_secs: env_or("CIRCUIT_COOLDOWN_SECS", 300),
            circuit_error_threshold: env_or("CIRCUIT_ERROR_THRESHOLD", 5),
            placement_timeout_secs: env_or("PLACEMENT_TIMEOUT_SECS", 10),
            odds_retention_days: env_or("ODDS_RETENTION_DAYS", 730),
            tracing_enabled: env_or("TRACING_ENABLED", false),
            tracing_collector_addr: std::env::var("TRACING_COLLECTOR_ADDR").ok(),
            exchange_client_identity_path: std::env::var("EXCHANGE_CLIENT_IDENTITY_PATH").ok(),
            risk_level: std::env::var("RISK_LEVEL").unwrap_or_else(|_| "moderate".to_string()),
            target_return: env_or("TARGET_RETURN", 0.1),
            max_drawdown_limit: env_or("MAX_DRAWDOWN_LIMIT", 0.2),
            min_win_rate: env_or("MIN_WIN_RATE", 0.5),
            max_candidates: env_or("MAX_CANDIDATES", 3),
            auto_promote_score_floor: env_or("AUTO_PROMOTE_SCORE_FLOOR", 0.6),
            validation_backtest_min_bets: env_or("VALIDATION_BACKTEST_MIN_BETS", 20),
            backtest_lookback: env_or("BACKTEST_LOOKBACK", 5),
        })
    }
}
