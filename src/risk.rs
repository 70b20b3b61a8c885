//! Risk Ledger (C1)
//!
//! Authoritative in-memory view of bankroll, exposure, and daily P&L; the
//! gatekeeper every wager passes through before it reaches the exchange.
//! Held behind a `parking_lot::RwLock` so `Snapshot` reads are lock-free
//! against a consistent clone and `Reserve`/`Release` are short critical
//! sections that never span an RPC (§5).

use crate::errors::RiskError;
use crate::models::{CircuitState, DayBoundary, RiskSnapshot};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Reservation {
    race_id: i64,
    #[allow(dead_code)]
    strategy_id: i64,
    amount: f64,
}

struct Inner {
    bankroll: f64,
    exposure: f64,
    daily_pnl: f64,
    max_exposure: f64,
    max_daily_loss: f64,
    circuit_state: CircuitState,
    day_boundary: DateTime<Utc>,
    sequence: u64,
    reservations: HashMap<u64, Reservation>,
    next_reservation_id: u64,
}

/// A granted reservation's handle, returned to the caller so `Release` can
/// release exactly the amount reserved under it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservationId(pub u64);

pub struct RiskLedger {
    inner: RwLock<Inner>,
}

impl RiskLedger {
    pub fn new(bankroll: f64, max_exposure: f64, max_daily_loss: f64, day_boundary: DateTime<Utc>) -> Self {
        Self {
            inner: RwLock::new(Inner {
                bankroll,
                exposure: 0.0,
                daily_pnl: 0.0,
                max_exposure,
                max_daily_loss,
                circuit_state: CircuitState::Closed,
                day_boundary,
                sequence: 0,
                reservations: HashMap::new(),
                next_reservation_id: 1,
            }),
        }
    }

    pub fn from_snapshot(snap: &RiskSnapshot, max_exposure: f64, max_daily_loss: f64) -> Self {
        Self {
            inner: RwLock::new(Inner {
                bankroll: snap.bankroll,
                exposure: snap.exposure,
                daily_pnl: snap.daily_pnl,
                max_exposure,
                max_daily_loss,
                circuit_state: snap.circuit_state,
                day_boundary: snap.day_boundary,
                sequence: snap.sequence,
                reservations: HashMap::new(),
                next_reservation_id: 1,
            }),
        }
    }

    /// Atomic: granted only if (exposure + stake) <= MaxExposure AND
    /// (dailyPnL - stake) > -MaxDailyLoss AND circuit is closed/half-open (I1, I2).
    pub fn reserve(
        &self,
        stake: f64,
        race_id: i64,
        strategy_id: i64,
    ) -> Result<ReservationId, RiskError> {
        let mut inner = self.inner.write();

        if inner.circuit_state == CircuitState::Open {
            return Err(RiskError::TradingPaused);
        }

        if inner.exposure + stake > inner.max_exposure + 1e-9 {
            return Err(RiskError::BudgetExceeded);
        }

        if inner.daily_pnl - stake <= -inner.max_daily_loss {
            return Err(RiskError::DailyLossExceeded);
        }

        let id = inner.next_reservation_id;
        inner.next_reservation_id += 1;
        inner.exposure += stake;
        inner.sequence += 1;
        inner.reservations.insert(
            id,
            Reservation {
                race_id,
                strategy_id,
                amount: stake,
            },
        );

        Ok(ReservationId(id))
    }

    /// Releases reserved exposure (full, or the unmatched remainder on a
    /// partial fill) and applies a realized P&L delta, if any. `amount` must
    /// be <= the reservation's remaining amount.
    pub fn release(&self, reservation: ReservationId, amount: f64, pnl_delta: f64) {
        let mut inner = self.inner.write();

        let mut release_amount = 0.0;
        let mut should_remove = false;
        if let Some(res) = inner.reservations.get_mut(&reservation.0) {
            release_amount = amount.min(res.amount);
            res.amount -= release_amount;
            should_remove = res.amount <= 1e-9;
        } else {
            // Defensive: releasing an unknown/duplicate reservation id is a
            // no-op on exposure, but P&L still applies (e.g. re-delivered
            // settlement event per P5 idempotency).
        }
        inner.exposure = (inner.exposure - release_amount).max(0.0);
        if should_remove {
            inner.reservations.remove(&reservation.0);
        }

        if pnl_delta != 0.0 {
            inner.bankroll += pnl_delta;
            inner.daily_pnl += pnl_delta;
        }
        inner.sequence += 1;
    }

    /// Releases exposure without a known reservation id (used when
    /// reconciling orders placed before a restart). Caller supplies the
    /// race id only for audit context; no lookup is required.
    pub fn release_untracked(&self, amount: f64, pnl_delta: f64) {
        let mut inner = self.inner.write();
        inner.exposure = (inner.exposure - amount).max(0.0);
        if pnl_delta != 0.0 {
            inner.bankroll += pnl_delta;
            inner.daily_pnl += pnl_delta;
        }
        inner.sequence += 1;
    }

    pub fn snapshot(&self) -> RiskSnapshot {
        let inner = self.inner.read();
        RiskSnapshot {
            bankroll: inner.bankroll,
            exposure: inner.exposure,
            daily_pnl: inner.daily_pnl,
            circuit_state: inner.circuit_state,
            day_boundary: inner.day_boundary,
            sequence: inner.sequence,
        }
    }

    /// Restores bankroll/exposure/P&L/day-boundary from a persisted
    /// snapshot taken before a restart. Open reservations are not restored
    /// here; `OrderManager::reconcile_on_startup` re-derives them from the
    /// store's non-terminal bets.
    pub fn restore(&self, snap: &RiskSnapshot) {
        let mut inner = self.inner.write();
        inner.bankroll = snap.bankroll;
        inner.exposure = snap.exposure;
        inner.daily_pnl = snap.daily_pnl;
        inner.circuit_state = snap.circuit_state;
        inner.day_boundary = snap.day_boundary;
        inner.sequence = snap.sequence;
    }

    pub fn set_circuit_state(&self, state: CircuitState) {
        let mut inner = self.inner.write();
        inner.circuit_state = state;
        inner.sequence += 1;
    }

    /// Zeroes daily P&L at the configured day boundary. Idempotent if `now`
    /// has not yet crossed the next boundary.
    pub fn rollover_day(&self, now: DateTime<Utc>, boundary: DayBoundary, tz: &str) {
        let mut inner = self.inner.write();
        let next_boundary = next_day_boundary(inner.day_boundary, boundary, tz);
        if now >= next_boundary {
            inner.daily_pnl = 0.0;
            inner.day_boundary = next_boundary;
            inner.sequence += 1;
        }
    }

    /// Re-creates a reservation handle for a bet found still outstanding at
    /// startup, with its real remaining (unmatched) amount rather than a
    /// placeholder. `exposure` itself is not touched here: the persisted
    /// risk snapshot restored just before this runs already includes this
    /// amount, so adding it again via `reserve` would double-count it. This
    /// only registers a `Reservation` so a later `release` against the
    /// returned id drains the right quantity instead of being clamped to
    /// zero against an empty reservation.
    pub fn restore_reservation(&self, amount: f64, race_id: i64, strategy_id: i64) -> ReservationId {
        let mut inner = self.inner.write();
        let id = inner.next_reservation_id;
        inner.next_reservation_id += 1;
        inner.reservations.insert(
            id,
            Reservation {
                race_id,
                strategy_id,
                amount,
            },
        );
        inner.sequence += 1;
        ReservationId(id)
    }

    pub fn reservation_for_race(&self, race_id: i64) -> f64 {
        let inner = self.inner.read();
        inner
            .reservations
            .values()
            .filter(|r| r.race_id == race_id)
            .map(|r| r.amount)
            .sum()
    }
}

/// Advances `previous` to the next day boundary. `Utc` mode is a flat
/// 24h step; `Local` mode finds the next local midnight in `tz` and
/// converts it back to UTC, so the boundary tracks wall-clock midnight
/// through DST transitions instead of drifting by a fixed offset.
fn next_day_boundary(previous: DateTime<Utc>, mode: DayBoundary, tz: &str) -> DateTime<Utc> {
    match mode {
        DayBoundary::Utc => previous + chrono::Duration::days(1),
        DayBoundary::Local => {
            let zone: chrono_tz::Tz = tz.parse().unwrap_or(chrono_tz::UTC);
            let local = previous.with_timezone(&zone);
            let next_midnight = (local.date_naive() + chrono::Duration::days(1))
                .and_hms_opt(0, 0, 0)
                .expect("midnight is always a valid time");
            zone.from_local_datetime(&next_midnight)
                .single()
                .unwrap_or_else(|| zone.from_utc_datetime(&next_midnight))
                .with_timezone(&Utc)
        }
    }
}

pub fn default_day_boundary() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> RiskLedger {
        RiskLedger::new(1000.0, 500.0, 100.0, default_day_boundary())
    }

    #[test]
    fn reserve_grants_within_budget() {
        let l = ledger();
        let r = l.reserve(200.0, 1, 1).unwrap();
        assert_eq!(l.snapshot().exposure, 200.0);
        l.release(r, 200.0, 0.0);
        assert_eq!(l.snapshot().exposure, 0.0);
    }

    #[test]
    fn reserve_rejects_over_exposure_cap() {
        let l = ledger();
        l.reserve(400.0, 1, 1).unwrap();
        let err = l.reserve(200.0, 2, 1).unwrap_err();
        assert_eq!(err, RiskError::BudgetExceeded);
    }

    // P2: for any interleaving of Reserve/Release, sum reserved never
    // exceeds MaxExposure.
    #[test]
    fn exposure_cap_holds_under_interleaving() {
        let l = RiskLedger::new(10_000.0, 500.0, 10_000.0, default_day_boundary());
        let mut ids = vec![];
        for _ in 0..10 {
            if let Ok(id) = l.reserve(73.0, 1, 1) {
                ids.push(id);
            }
            assert!(l.snapshot().exposure <= 500.0 + 1e-6);
        }
        for id in ids {
            l.release(id, 73.0, 0.0);
        }
        assert_eq!(l.snapshot().exposure, 0.0);
    }

    // P3: once cumulative daily P&L <= -MaxDailyLoss, no Reserve grants
    // until rollover.
    #[test]
    fn daily_loss_gate_blocks_until_rollover() {
        let l = ledger();
        let r1 = l.reserve(50.0, 1, 1).unwrap();
        l.release(r1, 50.0, -60.0);
        let r2 = l.reserve(50.0, 1, 1).unwrap();
        l.release(r2, 50.0, -45.0);

        let err = l.reserve(10.0, 1, 1).unwrap_err();
        assert_eq!(err, RiskError::DailyLossExceeded);

        l.rollover_day(default_day_boundary() + chrono::Duration::days(1), DayBoundary::Utc, "UTC");
        assert!(l.snapshot().daily_pnl == 0.0);
        assert!(l.reserve(10.0, 1, 1).is_ok());
    }

    #[test]
    fn local_day_boundary_advances_to_next_midnight_in_zone() {
        // 2024-01-01 23:00 UTC is 2024-01-02 09:00 in Australia/Sydney
        // (UTC+10 in January, no DST ambiguity), so the next Sydney
        // midnight is 2024-01-02 00:00 local = 2024-01-01 14:00 UTC,
        // already behind `previous`; the boundary must advance a further
        // day to 2024-01-03 00:00 local.
        let previous = Utc.with_ymd_and_hms(2024, 1, 1, 23, 0, 0).unwrap();
        let next = next_day_boundary(previous, DayBoundary::Local, "Australia/Sydney");
        assert!(next > previous);
        let sydney: chrono_tz::Tz = "Australia/Sydney".parse().unwrap();
        let local_next = next.with_timezone(&sydney);
        assert_eq!(local_next.format("%H:%M").to_string(), "00:00");
    }

    #[test]
    fn trading_paused_when_circuit_open() {
        let l = ledger();
        l.set_circuit_state(CircuitState::Open);
        let err = l.reserve(1.0, 1, 1).unwrap_err();
        assert_eq!(err, RiskError::TradingPaused);
    }

    #[test]
    fn release_is_idempotent_on_unknown_reservation() {
        let l = ledger();
        // Re-delivering a release for an id already fully released (or never
        // seen) must not double-count or panic (P5).
        l.release(ReservationId(9999), 10.0, 0.0);
        assert_eq!(l.snapshot().exposure, 0.0);
    }
}
