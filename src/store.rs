//! Persistent store
//!
//! Single `rusqlite::Connection` behind `Arc<tokio::sync::Mutex<_>>`, the
//! same handle shape this codebase's vault db used. WAL mode, one schema
//! migration run at construction, no ORM.

use crate::models::{
    BacktestResult, Bet, BetStatus, CircuitState, OddsSnapshot, Race, RaceStatus, Runner, Side,
    Strategy, StrategyParams,
};
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

fn race_status_str(s: RaceStatus) -> &'static str {
    match s {
        RaceStatus::Scheduled => "scheduled",
        RaceStatus::Open => "open",
        RaceStatus::InProgress => "in_progress",
        RaceStatus::Closed => "closed",
        RaceStatus::Abandoned => "abandoned",
    }
}

fn race_status_from_str(s: &str) -> RaceStatus {
    match s {
        "open" => RaceStatus::Open,
        "in_progress" => RaceStatus::InProgress,
        "closed" => RaceStatus::Closed,
        "abandoned" => RaceStatus::Abandoned,
        _ => RaceStatus::Scheduled,
    }
}

fn side_str(s: Side) -> &'static str {
    match s {
        Side::Back => "back",
        Side::Lay => "lay",
    }
}

fn side_from_str(s: &str) -> Side {
    match s {
        "lay" => Side::Lay,
        _ => Side::Back,
    }
}

fn bet_status_str(s: BetStatus) -> &'static str {
    match s {
        BetStatus::Pending => "pending",
        BetStatus::Matched => "matched",
        BetStatus::PartiallyMatched => "partially_matched",
        BetStatus::Cancelled => "cancelled",
        BetStatus::Settled => "settled",
        BetStatus::Void => "void",
    }
}

fn bet_status_from_str(s: &str) -> BetStatus {
    match s {
        "matched" => BetStatus::Matched,
        "partially_matched" => BetStatus::PartiallyMatched,
        "cancelled" => BetStatus::Cancelled,
        "settled" => BetStatus::Settled,
        "void" => BetStatus::Void,
        _ => BetStatus::Pending,
    }
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open store db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store db")?;
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn upsert_race(&self, race: &Race) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO races (id, scheduled_start, actual_start, track, distance_m, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                scheduled_start = excluded.scheduled_start,
                actual_start = excluded.actual_start,
                track = excluded.track,
                distance_m = excluded.distance_m,
                status = excluded.status",
            params![
                race.id,
                to_ts(race.scheduled_start),
                race.actual_start.map(to_ts),
                race.track,
                race.distance_m,
                race_status_str(race.status),
            ],
        )?;
        Ok(())
    }

    pub async fn upsert_runner(&self, runner: &Runner) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO runners (id, race_id, trap, name, form_rating, weight_kg)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                trap = excluded.trap, name = excluded.name,
                form_rating = excluded.form_rating, weight_kg = excluded.weight_kg",
            params![
                runner.id,
                runner.race_id,
                runner.trap,
                runner.name,
                runner.form_rating,
                runner.weight_kg,
            ],
        )?;
        Ok(())
    }

    pub async fn races_due_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Race>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, scheduled_start, actual_start, track, distance_m, status
             FROM races WHERE scheduled_start >= ?1 AND scheduled_start < ?2
             ORDER BY scheduled_start ASC",
        )?;
        let rows = stmt
            .query_map(params![to_ts(from), to_ts(to)], |row| {
                Ok(Race {
                    id: row.get(0)?,
                    scheduled_start: from_ts(row.get(1)?),
                    actual_start: row.get::<_, Option<i64>>(2)?.map(from_ts),
                    track: row.get(3)?,
                    distance_m: row.get(4)?,
                    status: race_status_from_str(&row.get::<_, String>(5)?),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn runners_for_race(&self, race_id: i64) -> Result<Vec<Runner>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, race_id, trap, name, form_rating, weight_kg
             FROM runners WHERE race_id = ?1 ORDER BY trap ASC",
        )?;
        let rows = stmt
            .query_map(params![race_id], |row| {
                Ok(Runner {
                    id: row.get(0)?,
                    race_id: row.get(1)?,
                    trap: row.get(2)?,
                    name: row.get(3)?,
                    form_rating: row.get(4)?,
                    weight_kg: row.get(5)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Append-only. Never updates an existing row (I4).
    pub async fn insert_odds_snapshot(&self, snap: &OddsSnapshot) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO odds_snapshots
                (ts, race_id, runner_id, back_price, lay_price, back_depth, lay_depth, last_traded_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                to_ts(snap.ts),
                snap.race_id,
                snap.runner_id,
                snap.back_price,
                snap.lay_price,
                snap.back_depth,
                snap.lay_depth,
                snap.last_traded_price,
            ],
        )?;
        Ok(())
    }

    /// Latest snapshot per runner with `ts <= as_of`, enforcing the temporal
    /// safety invariant (I4) at the query boundary rather than trusting the
    /// caller to filter afterward.
    pub async fn latest_odds_as_of(
        &self,
        race_id: i64,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<OddsSnapshot>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT o.ts, o.race_id, o.runner_id, o.back_price, o.lay_price,
                    o.back_depth, o.lay_depth, o.last_traded_price
             FROM odds_snapshots o
             INNER JOIN (
                SELECT runner_id, MAX(ts) AS max_ts FROM odds_snapshots
                WHERE race_id = ?1 AND ts <= ?2 GROUP BY runner_id
             ) latest ON o.runner_id = latest.runner_id AND o.ts = latest.max_ts
             WHERE o.race_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![race_id, to_ts(as_of)], |row| {
                Ok(OddsSnapshot {
                    ts: from_ts(row.get(0)?),
                    race_id: row.get(1)?,
                    runner_id: row.get(2)?,
                    back_price: row.get(3)?,
                    lay_price: row.get(4)?,
                    back_depth: row.get(5)?,
                    lay_depth: row.get(6)?,
                    last_traded_price: row.get(7)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Deletes odds rows older than the retention window. Run on a slow
    /// periodic tick by the feedback loop, not per-evaluation.
    pub async fn sweep_expired_odds(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM odds_snapshots WHERE ts < ?1",
            params![to_ts(cutoff)],
        )?;
        Ok(n)
    }

    pub async fn active_strategies(&self) -> Result<Vec<Strategy>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, name, active, min_edge, min_confidence, min_odds, max_odds,
                    min_liquidity, kelly_fraction, max_stake_per_bet, min_stake
             FROM strategies WHERE active = 1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Strategy {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    active: row.get::<_, i64>(2)? != 0,
                    params: StrategyParams {
                        min_edge: row.get(3)?,
                        min_confidence: row.get(4)?,
                        min_odds: row.get(5)?,
                        max_odds: row.get(6)?,
                        min_liquidity: row.get(7)?,
                        kelly_fraction: row.get(8)?,
                        max_stake_per_bet: row.get(9)?,
                        min_stake: row.get(10)?,
                    },
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn upsert_strategy(&self, s: &Strategy) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategies
                (id, name, active, min_edge, min_confidence, min_odds, max_odds,
                 min_liquidity, kelly_fraction, max_stake_per_bet, min_stake)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, active = excluded.active,
                min_edge = excluded.min_edge, min_confidence = excluded.min_confidence,
                min_odds = excluded.min_odds, max_odds = excluded.max_odds,
                min_liquidity = excluded.min_liquidity, kelly_fraction = excluded.kelly_fraction,
                max_stake_per_bet = excluded.max_stake_per_bet, min_stake = excluded.min_stake",
            params![
                s.id,
                s.name,
                s.active as i64,
                s.params.min_edge,
                s.params.min_confidence,
                s.params.min_odds,
                s.params.max_odds,
                s.params.min_liquidity,
                s.params.kelly_fraction,
                s.params.max_stake_per_bet,
                s.params.min_stake,
            ],
        )?;
        Ok(())
    }

    pub async fn insert_bet(&self, bet: &Bet) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO bets
                (race_id, runner_id, strategy_id, side, requested_odds, stake, status,
                 matched_size, matched_price, placed_at, matched_at, cancelled_at, settled_at,
                 pnl, commission, exchange_bet_id, exchange_market_id, idempotency_token)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                bet.race_id,
                bet.runner_id,
                bet.strategy_id,
                side_str(bet.side),
                bet.requested_odds,
                bet.stake,
                bet_status_str(bet.status),
                bet.matched_size,
                bet.matched_price,
                to_ts(bet.placed_at),
                bet.matched_at.map(to_ts),
                bet.cancelled_at.map(to_ts),
                bet.settled_at.map(to_ts),
                bet.pnl,
                bet.commission,
                bet.exchange_bet_id,
                bet.exchange_market_id,
                bet.idempotency_token,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn update_bet(&self, bet: &Bet) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE bets SET status=?1, matched_size=?2, matched_price=?3, matched_at=?4,
                cancelled_at=?5, settled_at=?6, pnl=?7, commission=?8,
                exchange_bet_id=?9, exchange_market_id=?10
             WHERE id=?11",
            params![
                bet_status_str(bet.status),
                bet.matched_size,
                bet.matched_price,
                bet.matched_at.map(to_ts),
                bet.cancelled_at.map(to_ts),
                bet.settled_at.map(to_ts),
                bet.pnl,
                bet.commission,
                bet.exchange_bet_id,
                bet.exchange_market_id,
                bet.id,
            ],
        )?;
        Ok(())
    }

    pub async fn bet_by_idempotency_token(&self, token: &str) -> Result<Option<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, race_id, runner_id, strategy_id, side, requested_odds, stake, status,
                    matched_size, matched_price, placed_at, matched_at, cancelled_at, settled_at,
                    pnl, commission, exchange_bet_id, exchange_market_id, idempotency_token
             FROM bets WHERE idempotency_token = ?1",
        )?;
        stmt.query_row(params![token], row_to_bet).optional().map_err(Into::into)
    }

    pub async fn bets_non_terminal(&self) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, race_id, runner_id, strategy_id, side, requested_odds, stake, status,
                    matched_size, matched_price, placed_at, matched_at, cancelled_at, settled_at,
                    pnl, commission, exchange_bet_id, exchange_market_id, idempotency_token
             FROM bets WHERE status NOT IN ('cancelled','settled','void')",
        )?;
        let rows = stmt.query_map([], row_to_bet)?.filter_map(|r| r.ok()).collect();
        Ok(rows)
    }

    pub async fn settled_bets_since(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, race_id, runner_id, strategy_id, side, requested_odds, stake, status,
                    matched_size, matched_price, placed_at, matched_at, cancelled_at, settled_at,
                    pnl, commission, exchange_bet_id, exchange_market_id, idempotency_token
             FROM bets WHERE status = 'settled' AND settled_at >= ?1
             ORDER BY settled_at ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![to_ts(since), limit as i64], row_to_bet)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Settled bets for a strategy within `[from, to)`, used by the offline
    /// backtest binary to summarize a historical window.
    pub async fn settled_bets_for_strategy_between(
        &self,
        strategy_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, race_id, runner_id, strategy_id, side, requested_odds, stake, status,
                    matched_size, matched_price, placed_at, matched_at, cancelled_at, settled_at,
                    pnl, commission, exchange_bet_id, exchange_market_id, idempotency_token
             FROM bets WHERE strategy_id = ?1 AND status = 'settled'
               AND settled_at >= ?2 AND settled_at < ?3
             ORDER BY settled_at ASC",
        )?;
        let rows = stmt
            .query_map(params![strategy_id, to_ts(from), to_ts(to)], row_to_bet)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub async fn insert_backtest_result(&self, result: &BacktestResult) -> Result<i64> {
        let conn = self.conn.lock().await;
        let ml_features = serde_json::to_string(&result.ml_features)?;
        conn.execute(
            "INSERT INTO backtest_results
                (strategy_id, composite_score, sharpe, roi, max_drawdown, win_rate,
                 profit_factor, total_bets, method, ml_features, created_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
            params![
                result.strategy_id,
                result.composite_score,
                result.sharpe,
                result.roi,
                result.max_drawdown,
                result.win_rate,
                result.profit_factor,
                result.total_bets,
                result.method,
                ml_features,
                to_ts(result.created_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent `limit` `BacktestResult`s for a strategy, newest first —
    /// the window the feedback loop aggregates over when briefing the
    /// scorer's generate-strategy endpoint.
    pub async fn recent_backtest_results(
        &self,
        strategy_id: i64,
        limit: usize,
    ) -> Result<Vec<BacktestResult>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT id, strategy_id, composite_score, sharpe, roi, max_drawdown, win_rate,
                    profit_factor, total_bets, method, ml_features, created_at
             FROM backtest_results WHERE strategy_id = ?1
             ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![strategy_id, limit as i64], row_to_backtest_result)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    /// Rolls up a strategy's performance over an evaluation window. Kept
    /// alongside the per-run `backtest_results` rows as a denormalized
    /// per-window summary the feedback loop and any future dashboarding
    /// query without re-aggregating `backtest_results` each time.
    pub async fn upsert_strategy_performance(
        &self,
        strategy_id: i64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        composite_score: f64,
        total_bets: u32,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO strategy_performance
                (strategy_id, window_start, window_end, composite_score, total_bets)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(strategy_id, window_start) DO UPDATE SET
                window_end = excluded.window_end,
                composite_score = excluded.composite_score,
                total_bets = excluded.total_bets",
            params![
                strategy_id,
                to_ts(window_start),
                to_ts(window_end),
                composite_score,
                total_bets,
            ],
        )?;
        Ok(())
    }

    /// The process-wide idempotency-token prefix, persisted so a restarted
    /// process recognizes the *same* prefix (and therefore its own prior
    /// in-flight orders) rather than minting a fresh, unrecognizable one on
    /// every boot.
    pub async fn load_idempotency_prefix(&self) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT idempotency_prefix FROM process_identity WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub async fn save_idempotency_prefix(&self, prefix: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO process_identity (id, idempotency_prefix) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET idempotency_prefix = excluded.idempotency_prefix",
            params![prefix],
        )?;
        Ok(())
    }

    pub async fn save_risk_snapshot(
        &self,
        bankroll: f64,
        exposure: f64,
        daily_pnl: f64,
        circuit_state: CircuitState,
        day_boundary: DateTime<Utc>,
        sequence: u64,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let state = match circuit_state {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        conn.execute(
            "INSERT INTO risk_snapshot (id, bankroll, exposure, daily_pnl, circuit_state, day_boundary, sequence)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                bankroll=excluded.bankroll, exposure=excluded.exposure, daily_pnl=excluded.daily_pnl,
                circuit_state=excluded.circuit_state, day_boundary=excluded.day_boundary, sequence=excluded.sequence",
            params![bankroll, exposure, daily_pnl, state, to_ts(day_boundary), sequence as i64],
        )?;
        Ok(())
    }

    pub async fn load_risk_snapshot(
        &self,
    ) -> Result<Option<(f64, f64, f64, CircuitState, DateTime<Utc>, u64)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "SELECT bankroll, exposure, daily_pnl, circuit_state, day_boundary, sequence
             FROM risk_snapshot WHERE id = 1",
        )?;
        let row = stmt
            .query_row([], |row| {
                let state_str: String = row.get(3)?;
                let state = match state_str.as_str() {
                    "open" => CircuitState::Open,
                    "half_open" => CircuitState::HalfOpen,
                    _ => CircuitState::Closed,
                };
                Ok((
                    row.get::<_, f64>(0)?,
                    row.get::<_, f64>(1)?,
                    row.get::<_, f64>(2)?,
                    state,
                    from_ts(row.get::<_, i64>(4)?),
                    row.get::<_, i64>(5)? as u64,
                ))
            })
            .optional()?;
        Ok(row)
    }
}

fn row_to_bet(row: &rusqlite::Row) -> rusqlite::Result<Bet> {
    Ok(Bet {
        id: row.get(0)?,
        race_id: row.get(1)?,
        runner_id: row.get(2)?,
        strategy_id: row.get(3)?,
        side: side_from_str(&row.get::<_, String>(4)?),
        requested_odds: row.get(5)?,
        stake: row.get(6)?,
        status: bet_status_from_str(&row.get::<_, String>(7)?),
        matched_size: row.get(8)?,
        matched_price: row.get(9)?,
        placed_at: from_ts(row.get(10)?),
        matched_at: row.get::<_, Option<i64>>(11)?.map(from_ts),
        cancelled_at: row.get::<_, Option<i64>>(12)?.map(from_ts),
        settled_at: row.get::<_, Option<i64>>(13)?.map(from_ts),
        pnl: row.get(14)?,
        commission: row.get(15)?,
        exchange_bet_id: row.get(16)?,
        exchange_market_id: row.get(17)?,
        idempotency_token: row.get(18)?,
    })
}

fn row_to_backtest_result(row: &rusqlite::Row) -> rusqlite::Result<BacktestResult> {
    let ml_features_json: String = row.get(10)?;
    let ml_features = serde_json::from_str(&ml_features_json).unwrap_or_default();
    Ok(BacktestResult {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        composite_score: row.get(2)?,
        sharpe: row.get(3)?,
        roi: row.get(4)?,
        max_drawdown: row.get(5)?,
        win_rate: row.get(6)?,
        profit_factor: row.get(7)?,
        total_bets: row.get::<_, i64>(8)? as u32,
        method: row.get(9)?,
        ml_features,
        created_at: from_ts(row.get(11)?),
    })
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS races (
            id INTEGER PRIMARY KEY,
            scheduled_start INTEGER NOT NULL,
            actual_start INTEGER,
            track TEXT NOT NULL,
            distance_m INTEGER NOT NULL,
            status TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_races_scheduled_start ON races(scheduled_start);

        CREATE TABLE IF NOT EXISTS runners (
            id INTEGER PRIMARY KEY,
            race_id INTEGER NOT NULL REFERENCES races(id),
            trap INTEGER NOT NULL,
            name TEXT NOT NULL,
            form_rating REAL,
            weight_kg REAL
        );
        CREATE INDEX IF NOT EXISTS idx_runners_race ON runners(race_id);

        CREATE TABLE IF NOT EXISTS odds_snapshots (
            ts INTEGER NOT NULL,
            race_id INTEGER NOT NULL,
            runner_id INTEGER NOT NULL,
            back_price REAL,
            lay_price REAL,
            back_depth REAL,
            lay_depth REAL,
            last_traded_price REAL
        );
        CREATE INDEX IF NOT EXISTS idx_odds_race_runner_ts ON odds_snapshots(race_id, runner_id, ts DESC);

        CREATE TABLE IF NOT EXISTS strategies (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL,
            min_edge REAL NOT NULL,
            min_confidence REAL NOT NULL,
            min_odds REAL NOT NULL,
            max_odds REAL NOT NULL,
            min_liquidity REAL,
            kelly_fraction REAL NOT NULL,
            max_stake_per_bet REAL NOT NULL,
            min_stake REAL NOT NULL
        );

        CREATE TABLE IF NOT EXISTS bets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            race_id INTEGER NOT NULL,
            runner_id INTEGER NOT NULL,
            strategy_id INTEGER NOT NULL,
            side TEXT NOT NULL,
            requested_odds REAL NOT NULL,
            stake REAL NOT NULL,
            status TEXT NOT NULL,
            matched_size REAL NOT NULL,
            matched_price REAL,
            placed_at INTEGER NOT NULL,
            matched_at INTEGER,
            cancelled_at INTEGER,
            settled_at INTEGER,
            pnl REAL,
            commission REAL,
            exchange_bet_id TEXT,
            exchange_market_id TEXT,
            idempotency_token TEXT NOT NULL UNIQUE
        );
        CREATE INDEX IF NOT EXISTS idx_bets_status ON bets(status);
        CREATE INDEX IF NOT EXISTS idx_bets_settled_at ON bets(settled_at);

        CREATE TABLE IF NOT EXISTS strategy_performance (
            strategy_id INTEGER NOT NULL,
            window_start INTEGER NOT NULL,
            window_end INTEGER NOT NULL,
            composite_score REAL NOT NULL,
            total_bets INTEGER NOT NULL,
            PRIMARY KEY (strategy_id, window_start)
        );

        CREATE TABLE IF NOT EXISTS backtest_results (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            strategy_id INTEGER NOT NULL,
            composite_score REAL NOT NULL,
            sharpe REAL NOT NULL,
            roi REAL NOT NULL,
            max_drawdown REAL NOT NULL,
            win_rate REAL NOT NULL,
            profit_factor REAL NOT NULL,
            total_bets INTEGER NOT NULL,
            method TEXT NOT NULL,
            ml_features TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS model_metadata (
            model_version TEXT PRIMARY KEY,
            promoted_at INTEGER,
            notes TEXT
        );

        CREATE TABLE IF NOT EXISTS process_identity (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            idempotency_prefix TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS risk_snapshot (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            bankroll REAL NOT NULL,
            exposure REAL NOT NULL,
            daily_pnl REAL NOT NULL,
            circuit_state TEXT NOT NULL,
            day_boundary INTEGER NOT NULL,
            sequence INTEGER NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RaceStatus;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn file_backed_store_survives_reopen() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap().to_string();

        let store = Store::open(&path).unwrap();
        store
            .upsert_race(&Race {
                id: 1,
                scheduled_start: Utc::now(),
                actual_start: None,
                track: "Monmore".into(),
                distance_m: 480,
                status: RaceStatus::Scheduled,
            })
            .await
            .unwrap();
        drop(store);

        // Reopening must rerun migrations idempotently and see prior rows.
        let reopened = Store::open(&path).unwrap();
        let due = reopened
            .races_due_between(Utc::now() - chrono::Duration::hours(1), Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn race_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let race = Race {
            id: 1,
            scheduled_start: Utc::now(),
            actual_start: None,
            track: "Monmore".into(),
            distance_m: 480,
            status: RaceStatus::Scheduled,
        };
        store.upsert_race(&race).await.unwrap();
        let due = store
            .races_due_between(race.scheduled_start - chrono::Duration::seconds(1), race.scheduled_start + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].track, "Monmore");
    }

    #[tokio::test]
    async fn odds_snapshot_respects_as_of_cutoff() {
        let store = Store::open_in_memory().unwrap();
        let t0 = Utc::now();
        store
            .insert_odds_snapshot(&OddsSnapshot {
                ts: t0,
                race_id: 1,
                runner_id: 1,
                back_price: Some(3.0),
                lay_price: Some(3.2),
                back_depth: None,
                lay_depth: None,
                last_traded_price: None,
            })
            .await
            .unwrap();
        store
            .insert_odds_snapshot(&OddsSnapshot {
                ts: t0 + chrono::Duration::seconds(10),
                race_id: 1,
                runner_id: 1,
                back_price: Some(3.5),
                lay_price: Some(3.7),
                back_depth: None,
                lay_depth: None,
                last_traded_price: None,
            })
            .await
            .unwrap();

        let as_of = store.latest_odds_as_of(1, t0 + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(as_of.len(), 1);
        assert_eq!(as_of[0].back_price, Some(3.0));
    }

    #[tokio::test]
    async fn bet_idempotency_lookup() {
        let store = Store::open_in_memory().unwrap();
        let bet = Bet {
            id: 0,
            race_id: 1,
            runner_id: 1,
            strategy_id: 1,
            side: Side::Back,
            requested_odds: 3.0,
            stake: 10.0,
            status: BetStatus::Pending,
            matched_size: 0.0,
            matched_price: None,
            placed_at: Utc::now(),
            matched_at: None,
            cancelled_at: None,
            settled_at: None,
            pnl: None,
            commission: None,
            exchange_bet_id: None,
            exchange_market_id: None,
            idempotency_token: "tok-1".into(),
        };
        store.insert_bet(&bet).await.unwrap();
        let found = store.bet_by_idempotency_token("tok-1").await.unwrap();
        assert!(found.is_some());
        assert!(store.bet_by_idempotency_token("tok-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idempotency_prefix_persists_across_save_and_load() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_idempotency_prefix().await.unwrap().is_none());
        store.save_idempotency_prefix("tr-abc-").await.unwrap();
        assert_eq!(store.load_idempotency_prefix().await.unwrap(), Some("tr-abc-".to_string()));
        store.save_idempotency_prefix("tr-xyz-").await.unwrap();
        assert_eq!(store.load_idempotency_prefix().await.unwrap(), Some("tr-xyz-".to_string()));
    }

    #[tokio::test]
    async fn backtest_result_roundtrip_and_recency_order() {
        let store = Store::open_in_memory().unwrap();
        let first = BacktestResult {
            id: 0,
            strategy_id: 1,
            composite_score: 0.2,
            sharpe: 0.5,
            roi: 0.1,
            max_drawdown: 0.05,
            win_rate: 0.4,
            profit_factor: 1.2,
            total_bets: 10,
            method: "feedback-cycle".into(),
            ml_features: HashMap::from([("stake_mean".to_string(), 5.0)]),
            created_at: Utc::now() - chrono::Duration::seconds(10),
        };
        store.insert_backtest_result(&first).await.unwrap();
        let mut second = first.clone();
        second.composite_score = 0.8;
        second.created_at = Utc::now();
        store.insert_backtest_result(&second).await.unwrap();

        let recent = store.recent_backtest_results(1, 5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!((recent[0].composite_score - 0.8).abs() < 1e-9);
        assert_eq!(recent[0].ml_features["stake_mean"], 5.0);
    }

    #[tokio::test]
    async fn strategy_performance_upsert_updates_existing_window() {
        let store = Store::open_in_memory().unwrap();
        let window_start = Utc::now() - chrono::Duration::hours(1);
        let window_end = Utc::now();
        store
            .upsert_strategy_performance(1, window_start, window_end, 0.3, 10)
            .await
            .unwrap();
        store
            .upsert_strategy_performance(1, window_start, window_end, 0.6, 25)
            .await
            .unwrap();

        let conn = store.conn.lock().await;
        let (score, bets): (f64, i64) = conn
            .query_row(
                "SELECT composite_score, total_bets FROM strategy_performance WHERE strategy_id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert!((score - 0.6).abs() < 1e-9);
        assert_eq!(bets, 25);
    }

    #[tokio::test]
    async fn settled_bets_for_strategy_between_filters_by_window() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let mut bet = Bet {
            id: 0,
            race_id: 1,
            runner_id: 1,
            strategy_id: 9,
            side: Side::Back,
            requested_odds: 2.0,
            stake: 5.0,
            status: BetStatus::Settled,
            matched_size: 5.0,
            matched_price: Some(2.0),
            placed_at: now,
            matched_at: Some(now),
            cancelled_at: None,
            settled_at: Some(now),
            pnl: Some(1.0),
            commission: Some(0.1),
            exchange_bet_id: Some("x".into()),
            exchange_market_id: Some("m".into()),
            idempotency_token: "tok-in-window".into(),
        };
        store.insert_bet(&bet).await.unwrap();
        bet.idempotency_token = "tok-out-of-window".into();
        bet.settled_at = Some(now - chrono::Duration::days(2));
        store.insert_bet(&bet).await.unwrap();

        let found = store
            .settled_bets_for_strategy_between(9, now - chrono::Duration::hours(1), now + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].idempotency_token, "tok-in-window");
    }
}
