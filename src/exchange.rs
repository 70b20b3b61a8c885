//! Exchange REST client (C5 dependency)
//!
//! Session auth (username/password, optionally layered on a client
//! certificate identity) with proactive token refresh; list markets / read
//! book / place / cancel / query / list orders, a client-side token-bucket
//! rate limiter adapted from this codebase's inbound `RateLimitLayer` (there
//! applied per source IP on the way in; here applied per outbound call so a
//! burst of signals can't blow through the exchange's own limits), and a
//! dedicated `CircuitBreaker` that trips on exchange connectivity failures
//! independent of the trading-risk breaker the rest of the system watches.

use crate::circuit::{CircuitBreaker, CircuitConfig, CircuitState};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 20.0,
            refill_per_sec: 20.0,
        }
    }
}

struct RateLimiterState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket: tokens accrue at `refill_per_sec` up to
/// `capacity`, rather than resetting in discrete windows, so a caller that
/// spends down the bucket gets smoothly-increasing headroom back instead of
/// waiting for the next window edge.
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Mutex<RateLimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        let capacity = config.capacity;
        Self {
            config,
            state: Mutex::new(RateLimiterState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.config.refill_per_sec)
                    .min(self.config.capacity);
                state.last_refill = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let deficit = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(deficit / self.config.refill_per_sec))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub race_id: i64,
    pub runner_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Book {
    pub market_id: String,
    pub best_back: Option<f64>,
    pub best_lay: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Back,
    Lay,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaceOrderRequest {
    pub idempotency_token: String,
    pub market_id: String,
    pub side: OrderSide,
    pub price: f64,
    pub stake: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub exchange_bet_id: String,
    pub status: String,
    pub matched_size: f64,
    pub matched_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrderStatus {
    pub exchange_bet_id: String,
    /// Echoes the `Idempotency-Key` the order was placed with, letting a
    /// restarted process recognize its own prior orders by prefix.
    #[serde(default)]
    pub client_order_id: Option<String>,
    pub status: String,
    pub matched_size: f64,
    pub matched_price: Option<f64>,
    pub settled: bool,
    pub void: bool,
    pub pnl: Option<f64>,
    pub commission: Option<f64>,
}

struct Session {
    token: String,
    expires_at: DateTime<Utc>,
}

pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    session: tokio::sync::Mutex<Option<Session>>,
    limiter: RateLimiter,
    circuit: CircuitBreaker,
}

impl ExchangeClient {
    /// `client_identity_pem_path`, when set, points at a PEM bundle (client
    /// certificate followed by its private key) loaded as a `reqwest`
    /// `Identity` for mutual-TLS on top of the username/password session
    /// auth the exchange also requires.
    pub fn new(
        base_url: String,
        username: String,
        password: String,
        client_identity_pem_path: Option<&str>,
        circuit_error_threshold: u32,
        circuit_cooldown: ChronoDuration,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(path) = client_identity_pem_path {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading exchange client identity from {path}"))?;
            let identity = reqwest::Identity::from_pem(&pem)
                .context("parsing exchange client identity pem")?;
            builder = builder.identity(identity);
        }
        let http = builder.build().context("building exchange http client")?;

        Ok(Self {
            http,
            base_url,
            username,
            password,
            session: tokio::sync::Mutex::new(None),
            limiter: RateLimiter::new(RateLimiterConfig::default()),
            circuit: CircuitBreaker::new(CircuitConfig {
                max_daily_loss: f64::INFINITY,
                max_exposure: f64::INFINITY,
                consecutive_error_threshold: circuit_error_threshold,
                cooldown: circuit_cooldown,
            }),
        })
    }

    /// Fails fast without making a request when the connectivity breaker is
    /// open; otherwise records the outcome against it so a string of
    /// timeouts/5xxs trips the breaker the same way a string of trading
    /// losses trips the risk one.
    async fn guarded<T, Fut>(&self, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        if self.circuit.state() == CircuitState::Open {
            anyhow::bail!("exchange connectivity circuit breaker is open");
        }
        match fut.await {
            Ok(v) => {
                self.circuit.record_exchange_success();
                Ok(v)
            }
            Err(e) => {
                self.circuit.record_exchange_error(Utc::now());
                Err(e)
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Advances the connectivity breaker's half-open recovery timer; call
    /// this on the same tick as the trading risk breaker's own `tick`.
    pub fn tick_circuit(&self, now: DateTime<Utc>) {
        self.circuit.tick(now);
    }

    /// Returns a valid session token, refreshing proactively when the
    /// current one expires within the next 30 seconds.
    async fn token(&self) -> Result<String> {
        let mut guard = self.session.lock().await;
        let needs_refresh = match &*guard {
            Some(s) => Utc::now() + ChronoDuration::seconds(30) >= s.expires_at,
            None => true,
        };
        if needs_refresh {
            let resp: LoginResponse = self
                .http
                .post(format!("{}/session", self.base_url))
                .json(&serde_json::json!({
                    "username": self.username,
                    "password": self.password,
                }))
                .send()
                .await
                .context("exchange login request failed")?
                .error_for_status()
                .context("exchange login rejected")?
                .json()
                .await
                .context("exchange login response malformed")?;
            *guard = Some(Session {
                token: resp.token.clone(),
                expires_at: Utc::now() + ChronoDuration::seconds(resp.expires_in_secs),
            });
        }
        Ok(guard.as_ref().unwrap().token.clone())
    }

    pub async fn list_markets(&self, race_id: i64) -> Result<Vec<Market>> {
        self.guarded(self.list_markets_inner(race_id)).await
    }

    async fn list_markets_inner(&self, race_id: i64) -> Result<Vec<Market>> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        self.http
            .get(format!("{}/markets", self.base_url))
            .bearer_auth(token)
            .query(&[("race_id", race_id)])
            .send()
            .await
            .context("list_markets request failed")?
            .error_for_status()?
            .json()
            .await
            .context("list_markets response malformed")
    }

    pub async fn read_book(&self, market_id: &str) -> Result<Book> {
        self.guarded(self.read_book_inner(market_id)).await
    }

    async fn read_book_inner(&self, market_id: &str) -> Result<Book> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        self.http
            .get(format!("{}/markets/{}/book", self.base_url, market_id))
            .bearer_auth(token)
            .send()
            .await
            .context("read_book request failed")?
            .error_for_status()?
            .json()
            .await
            .context("read_book response malformed")
    }

    pub async fn place_order(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        self.guarded(self.place_order_inner(req)).await
    }

    async fn place_order_inner(&self, req: &PlaceOrderRequest) -> Result<OrderAck> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        let resp = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .header("Idempotency-Key", &req.idempotency_token)
            .json(req)
            .send()
            .await
            .context("place_order request failed")?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), "exchange rejected order placement");
        }
        resp.error_for_status()
            .context("place_order rejected")?
            .json()
            .await
            .context("place_order response malformed")
    }

    pub async fn cancel_order(&self, exchange_bet_id: &str) -> Result<()> {
        self.guarded(self.cancel_order_inner(exchange_bet_id)).await
    }

    async fn cancel_order_inner(&self, exchange_bet_id: &str) -> Result<()> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        self.http
            .delete(format!("{}/orders/{}", self.base_url, exchange_bet_id))
            .bearer_auth(token)
            .send()
            .await
            .context("cancel_order request failed")?
            .error_for_status()
            .context("cancel_order rejected")?;
        Ok(())
    }

    pub async fn query_order(&self, exchange_bet_id: &str) -> Result<OrderStatus> {
        self.guarded(self.query_order_inner(exchange_bet_id)).await
    }

    async fn query_order_inner(&self, exchange_bet_id: &str) -> Result<OrderStatus> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        self.http
            .get(format!("{}/orders/{}", self.base_url, exchange_bet_id))
            .bearer_auth(token)
            .send()
            .await
            .context("query_order request failed")?
            .error_for_status()?
            .json()
            .await
            .context("query_order response malformed")
    }

    /// Lists orders whose client order id (the idempotency token this
    /// process placed them with) starts with `client_order_id_prefix`, so a
    /// restarted process can recognize its own in-flight orders from a prior
    /// run and reconcile against them rather than inventing local state.
    pub async fn list_orders(&self, client_order_id_prefix: &str) -> Result<Vec<OrderStatus>> {
        self.guarded(self.list_orders_inner(client_order_id_prefix))
            .await
    }

    async fn list_orders_inner(&self, client_order_id_prefix: &str) -> Result<Vec<OrderStatus>> {
        self.limiter.acquire().await;
        let token = self.token().await?;
        self.http
            .get(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .query(&[("client_order_id_prefix", client_order_id_prefix)])
            .send()
            .await
            .context("list_orders request failed")?
            .error_for_status()?
            .json()
            .await
            .context("list_orders response malformed")
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
    expires_in_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_allows_burst_up_to_max() {
        let l = RateLimiter::new(RateLimiterConfig {
            capacity: 3.0,
            refill_per_sec: 3.0,
        });
        let start = Instant::now();
        for _ in 0..3 {
            l.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn rate_limiter_refills_continuously_rather_than_in_windows() {
        let l = RateLimiter::new(RateLimiterConfig {
            capacity: 1.0,
            refill_per_sec: 20.0,
        });
        l.acquire().await;
        let start = Instant::now();
        l.acquire().await;
        // A fixed-window limiter would wait for the whole window edge; a
        // token bucket only waits long enough to accrue the single token.
        assert!(start.elapsed() < Duration::from_millis(120));
    }

    #[test]
    fn client_without_identity_builds_successfully() {
        let client = ExchangeClient::new(
            "http://localhost:1".into(),
            "u".into(),
            "p".into(),
            None,
            5,
            ChronoDuration::seconds(60),
        );
        assert!(client.is_ok());
    }
}
