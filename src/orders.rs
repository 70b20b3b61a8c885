//! Order Manager (C5)
//!
//! Owns the authoritative Bet records: places signals against the exchange,
//! reserving stake through the Risk Ledger first; monitors outstanding bets
//! for fills; cancels on timeout; applies settlement P&L back to the
//! ledger. State transitions are keyed on (bet, target state) so a
//! re-delivered exchange event can never double-apply (I3, P5).

use crate::circuit::CircuitBreaker;
use crate::exchange::{ExchangeClient, OrderSide, OrderStatus, PlaceOrderRequest};
use crate::logging::Loggers;
use crate::metrics::Metrics;
use crate::models::{Bet, BetStatus, Side, Signal};
use crate::risk::{ReservationId, RiskLedger};
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Tracks the reservation backing a non-terminal bet so `Release` can be
/// issued with the right amount when it settles or cancels.
struct OpenBet {
    reservation: ReservationId,
}

pub struct OrderManager<'a> {
    pub risk: &'a RiskLedger,
    pub circuit: &'a CircuitBreaker,
    pub store: &'a Store,
    pub exchange: &'a ExchangeClient,
    pub metrics: &'a Metrics,
    pub loggers: &'a Loggers,
    /// Process-wide namespace stamped onto every client order id this
    /// process places, so a restart can pick its own orders back out of the
    /// exchange's full order list (finding: reconciliation must actually
    /// call the exchange, not just re-read local rows).
    pub idempotency_prefix: String,
    pub placement_timeout: std::time::Duration,
    open: Mutex<HashMap<i64, OpenBet>>,
}

impl<'a> OrderManager<'a> {
    pub fn new(
        risk: &'a RiskLedger,
        circuit: &'a CircuitBreaker,
        store: &'a Store,
        exchange: &'a ExchangeClient,
        metrics: &'a Metrics,
        loggers: &'a Loggers,
        idempotency_prefix: String,
        placement_timeout: std::time::Duration,
    ) -> Self {
        Self {
            risk,
            circuit,
            store,
            exchange,
            metrics,
            loggers,
            idempotency_prefix,
            placement_timeout,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve -> persist pending -> call exchange -> update with exchange
    /// ids, or release + cancel on reject/timeout. A half-open circuit
    /// permits at most one trial placement per cool-down window (I2); the
    /// breaker itself enforces that via `may_place`.
    pub async fn place(&self, signal: &Signal, market_id: &str, now: DateTime<Utc>) -> Result<Bet> {
        if !self.circuit.may_place() {
            anyhow::bail!("circuit breaker refused placement");
        }
        let reservation = self
            .risk
            .reserve(signal.stake, signal.race_id, signal.strategy_id)?;

        let idempotency_token = format!("{}{}", self.idempotency_prefix, Uuid::new_v4());
        let mut bet = Bet {
            id: 0,
            race_id: signal.race_id,
            runner_id: signal.runner_id,
            strategy_id: signal.strategy_id,
            side: signal.side,
            requested_odds: signal.target_odds,
            stake: signal.stake,
            status: BetStatus::Pending,
            matched_size: 0.0,
            matched_price: None,
            placed_at: now,
            matched_at: None,
            cancelled_at: None,
            settled_at: None,
            pnl: None,
            commission: None,
            exchange_bet_id: None,
            exchange_market_id: Some(market_id.to_string()),
            idempotency_token: idempotency_token.clone(),
        };
        bet.id = self.store.insert_bet(&bet).await?;

        let placement = tokio::time::timeout(
            self.placement_timeout,
            self.exchange.place_order(&PlaceOrderRequest {
                idempotency_token,
                market_id: market_id.to_string(),
                side: side_to_exchange(signal.side),
                price: signal.target_odds,
                stake: signal.stake,
            }),
        )
        .await;

        match placement {
            Ok(Ok(ack)) => {
                bet.exchange_bet_id = Some(ack.exchange_bet_id);
                bet.matched_size = ack.matched_size;
                bet.matched_price = ack.matched_price;
                let from = bet.status.to_string();
                bet.status = if ack.matched_size >= signal.stake - 1e-9 {
                    bet.matched_at = Some(now);
                    BetStatus::Matched
                } else if ack.matched_size > 0.0 {
                    BetStatus::PartiallyMatched
                } else {
                    BetStatus::Pending
                };
                self.store.update_bet(&bet).await?;
                self.open.lock().await.insert(bet.id, OpenBet { reservation });
                self.metrics.record_bet_placed(bet.stake);
                self.loggers.audit.bet_state_transition(
                    bet.id,
                    bet.exchange_market_id.as_deref().unwrap_or(market_id),
                    &from,
                    &bet.status.to_string(),
                );
            }
            Ok(Err(e)) => {
                self.risk.release(reservation, bet.stake, 0.0);
                let from = bet.status.to_string();
                bet.status = BetStatus::Cancelled;
                bet.cancelled_at = Some(now);
                self.store.update_bet(&bet).await?;
                self.loggers.audit.bet_state_transition(bet.id, market_id, &from, &bet.status.to_string());
                self.loggers.audit.reconciliation_mismatch(bet.id, &format!("exchange rejected placement: {e}"));
            }
            Err(_) => {
                // Placement-timeout: transition to cancelled(timeout). A
                // later ack for this idempotency token must not revive it
                // (§5) — the monitor loop checks store state, not the
                // timed-out future, before acting on any late response.
                self.risk.release(reservation, bet.stake, 0.0);
                let from = bet.status.to_string();
                bet.status = BetStatus::Cancelled;
                bet.cancelled_at = Some(now);
                self.store.update_bet(&bet).await?;
                self.loggers.audit.bet_state_transition(bet.id, market_id, &from, &bet.status.to_string());
            }
        }

        Ok(bet)
    }

    /// Polls the exchange for every non-terminal bet and reconciles
    /// matched-size/price. Intended to run on its own periodic tick.
    pub async fn monitor_once(&self, now: DateTime<Utc>) -> Result<()> {
        let outstanding = self.store.bets_non_terminal().await?;
        for mut bet in outstanding {
            let Some(exchange_bet_id) = bet.exchange_bet_id.clone() else {
                continue;
            };
            let status = match self.exchange.query_order(&exchange_bet_id).await {
                Ok(s) => s,
                Err(e) => {
                    self.loggers.audit.reconciliation_mismatch(bet.id, &format!("order status query failed: {e}"));
                    continue;
                }
            };

            if bet.status.is_terminal() {
                // A stale poll racing a concurrent settlement/cancel; the
                // idempotency key is (bet, target state) so this is a no-op.
                self.loggers.audit.reconciliation_mismatch(
                    bet.id,
                    "status poll returned for a bet already in a terminal state",
                );
                continue;
            }

            self.apply_order_status(&mut bet, status, now).await?;
        }
        Ok(())
    }

    /// Shared terminal/partial-fill transition logic used by both the
    /// periodic monitor and startup reconciliation, so a late or duplicated
    /// exchange event is handled identically regardless of which path saw
    /// it first.
    async fn apply_order_status(&self, bet: &mut Bet, status: OrderStatus, now: DateTime<Utc>) -> Result<()> {
        bet.matched_size = status.matched_size;
        bet.matched_price = status.matched_price;

        if status.void {
            self.on_settlement(bet, 0.0, 0.0, true, now).await?;
        } else if status.settled {
            let pnl = status.pnl.unwrap_or(0.0);
            let commission = status.commission.unwrap_or(0.0);
            self.on_settlement(bet, pnl, commission, false, now).await?;
        } else if status.matched_size >= bet.stake - 1e-9 {
            let from = bet.status.to_string();
            bet.status = BetStatus::Matched;
            bet.matched_at.get_or_insert(now);
            self.store.update_bet(bet).await?;
            self.loggers.audit.bet_state_transition(bet.id, "", &from, &bet.status.to_string());
        } else if status.matched_size > 0.0 {
            let from = bet.status.to_string();
            bet.status = BetStatus::PartiallyMatched;
            self.store.update_bet(bet).await?;
            self.loggers.audit.bet_state_transition(bet.id, "", &from, &bet.status.to_string());
        }
        Ok(())
    }

    pub async fn cancel(&self, bet_id: i64, now: DateTime<Utc>) -> Result<()> {
        let mut bets = self.store.bets_non_terminal().await?;
        let Some(bet) = bets.iter_mut().find(|b| b.id == bet_id) else {
            return Ok(());
        };
        if let Some(exchange_bet_id) = &bet.exchange_bet_id {
            self.exchange.cancel_order(exchange_bet_id).await?;
        }
        let unmatched = (bet.stake - bet.matched_size).max(0.0);
        if let Some(open) = self.open.lock().await.remove(&bet.id) {
            self.risk.release(open.reservation, unmatched, 0.0);
        } else {
            self.risk.release_untracked(unmatched, 0.0);
        }
        let from = bet.status.to_string();
        bet.status = BetStatus::Cancelled;
        bet.cancelled_at = Some(now);
        self.store.update_bet(bet).await?;
        self.loggers.audit.bet_state_transition(bet.id, "", &from, &bet.status.to_string());
        Ok(())
    }

    /// Settlement computes P&L `(matched_price - 1) * matched_size -
    /// commission` for a winning back, symmetric for lay; releases exposure
    /// and reports P&L to the Risk Ledger. Called at most once per bet per
    /// target state (I3) — the caller is expected to have already checked
    /// `bet.status.is_terminal()`.
    async fn on_settlement(
        &self,
        bet: &mut Bet,
        pnl: f64,
        commission: f64,
        void: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let unmatched = (bet.stake - bet.matched_size).max(0.0);
        let release_amount = if void { bet.stake } else { unmatched };
        // Full commission refund on void markets (resolved Open Question).
        let net_pnl = if void { 0.0 } else { pnl - commission };

        if let Some(open) = self.open.lock().await.remove(&bet.id) {
            self.risk.release(open.reservation, release_amount, net_pnl);
        } else {
            self.risk.release_untracked(release_amount, net_pnl);
        }

        let from = bet.status.to_string();
        bet.status = if void { BetStatus::Void } else { BetStatus::Settled };
        bet.settled_at = Some(now);
        bet.pnl = Some(net_pnl);
        bet.commission = Some(if void { 0.0 } else { commission });
        self.store.update_bet(bet).await?;
        self.metrics.record_bet_settled(net_pnl);
        self.loggers.audit.bet_state_transition(bet.id, "", &from, &bet.status.to_string());

        // No-op unless the breaker is currently mid half-open trial; a
        // cleanly void settlement counts the same as a win for recovery.
        self.circuit.confirm_half_open_trial(void || net_pnl >= 0.0, now);
        Ok(())
    }

    /// Reconciles in-flight bets against the exchange's own order listing,
    /// filtered to this process's idempotency-token prefix, rather than
    /// trusting local store rows alone. A bet whose client order id the
    /// exchange doesn't recognize (a prior process crashed before the order
    /// reached it, or the exchange purged it) is logged as a mismatch and
    /// reconciled best-effort from its last known local state.
    pub async fn reconcile_on_startup(&self, now: DateTime<Utc>) -> Result<()> {
        let outstanding = self.store.bets_non_terminal().await?;
        if outstanding.is_empty() {
            return Ok(());
        }

        let remote = self
            .exchange
            .list_orders(&self.idempotency_prefix)
            .await
            .unwrap_or_default();
        let by_token: HashMap<&str, &OrderStatus> = remote
            .iter()
            .filter_map(|s| s.client_order_id.as_deref().map(|t| (t, s)))
            .collect();

        for mut bet in outstanding {
            match by_token.get(bet.idempotency_token.as_str()) {
                Some(status) => {
                    self.apply_order_status(&mut bet, (*status).clone(), now).await?;
                }
                None => {
                    self.loggers.audit.reconciliation_mismatch(
                        bet.id,
                        "no matching order found on the exchange for this process's idempotency prefix",
                    );
                }
            }

            let unmatched = (bet.stake - bet.matched_size).max(0.0);
            if !bet.status.is_terminal() {
                let reservation = self.risk.restore_reservation(unmatched, bet.race_id, bet.strategy_id);
                self.open.lock().await.insert(bet.id, OpenBet { reservation });
            }
        }
        Ok(())
    }
}

fn side_to_exchange(side: Side) -> OrderSide {
    match side {
        Side::Back => OrderSide::Back,
        Side::Lay => OrderSide::Lay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBreaker, CircuitConfig};
    use crate::metrics::Metrics;
    use crate::risk::default_day_boundary;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            max_daily_loss: 100.0,
            max_exposure: 500.0,
            consecutive_error_threshold: 5,
            cooldown: chrono::Duration::seconds(300),
        })
    }

    #[test]
    fn side_mapping_is_stable() {
        assert_eq!(side_to_exchange(Side::Back), OrderSide::Back);
        assert_eq!(side_to_exchange(Side::Lay), OrderSide::Lay);
    }

    #[tokio::test]
    async fn cancel_on_unknown_bet_is_a_noop() {
        let store = Store::open_in_memory().unwrap();
        let risk = RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary());
        let circuit = breaker();
        let exchange = ExchangeClient::new(
            "http://localhost:1".into(),
            "u".into(),
            "p".into(),
            None,
            5,
            chrono::Duration::seconds(60),
        )
        .unwrap();
        let metrics = Metrics::for_test();
        let loggers = Loggers::default();
        let mgr = OrderManager::new(
            &risk,
            &circuit,
            &store,
            &exchange,
            &metrics,
            &loggers,
            "tr-test-".to_string(),
            std::time::Duration::from_secs(5),
        );
        assert!(mgr.cancel(9999, Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn reconcile_on_startup_is_a_noop_with_no_outstanding_bets() {
        let store = Store::open_in_memory().unwrap();
        let risk = RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary());
        let circuit = breaker();
        let exchange = ExchangeClient::new(
            "http://localhost:1".into(),
            "u".into(),
            "p".into(),
            None,
            5,
            chrono::Duration::seconds(60),
        )
        .unwrap();
        let metrics = Metrics::for_test();
        let loggers = Loggers::default();
        let mgr = OrderManager::new(
            &risk,
            &circuit,
            &store,
            &exchange,
            &metrics,
            &loggers,
            "tr-test-".to_string(),
            std::time::Duration::from_secs(5),
        );
        assert!(mgr.reconcile_on_startup(Utc::now()).await.is_ok());
    }
}
