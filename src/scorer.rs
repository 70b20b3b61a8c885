//! ML Scorer Client (C3)
//!
//! Thin `reqwest` wrapper around the external scoring service: Predict,
//! PredictBatch, EvaluateStrategy, SubmitFeedback and GenerateStrategy, each
//! under a deadline with bounded exponential backoff plus jitter, grounded on
//! this codebase's scraper retry loop (`execute_with_retry`).

use crate::errors::ScorerError;
use crate::models::{BacktestResult, Strategy};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize)]
pub struct PredictRequest {
    pub race_id: i64,
    pub runner_id: i64,
    pub strategy_id: i64,
    pub features: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PredictResponse {
    pub probability: f64,
    pub confidence: f64,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluateStrategyRequest {
    pub strategy_id: i64,
    pub bets: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateStrategyResponse {
    pub result: BacktestResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitFeedbackRequest {
    pub strategy: i64,
    pub composite: f64,
    pub sharpe: f64,
    pub roi: f64,
    pub max_drawdown: f64,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub total_bets: u32,
    pub method: String,
    pub ml_features: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitFeedbackResponse {
    pub accepted: bool,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateStrategyRequest {
    pub risk_level: String,
    pub target_return: f64,
    pub max_drawdown_limit: f64,
    pub min_win_rate: f64,
    pub max_candidates: u32,
    pub aggregated_features: HashMap<String, f64>,
    pub top_metrics: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerateStrategyResponse {
    pub strategies: Vec<Strategy>,
}

pub struct ScorerClient {
    http: reqwest::Client,
    base_url: String,
    deadline: Duration,
    max_retries: u32,
}

impl ScorerClient {
    pub fn new(base_url: String, deadline_ms: u64, max_retries: u32) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            deadline: Duration::from_millis(deadline_ms),
            max_retries,
        }
    }

    pub async fn predict(&self, req: &PredictRequest) -> Result<PredictResponse, ScorerError> {
        self.post_with_retry("/predict", req).await
    }

    pub async fn predict_batch(
        &self,
        reqs: &[PredictRequest],
    ) -> Result<Vec<PredictResponse>, ScorerError> {
        self.post_with_retry("/predict/batch", &reqs).await
    }

    pub async fn evaluate_strategy(
        &self,
        req: &EvaluateStrategyRequest,
    ) -> Result<EvaluateStrategyResponse, ScorerError> {
        self.post_with_retry("/strategy/evaluate", req).await
    }

    pub async fn submit_feedback(
        &self,
        req: &SubmitFeedbackRequest,
    ) -> Result<SubmitFeedbackResponse, ScorerError> {
        self.post_with_retry("/feedback", req).await
    }

    pub async fn generate_strategy(
        &self,
        req: &GenerateStrategyRequest,
    ) -> Result<GenerateStrategyResponse, ScorerError> {
        self.post_with_retry("/strategy/generate", req).await
    }

    async fn post_with_retry<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ScorerError> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = INITIAL_BACKOFF_MS;

        for attempt in 0..self.max_retries {
            let call = self.http.post(&url).json(body).send();
            match tokio::time::timeout(self.deadline, call).await {
                Ok(Ok(resp)) if resp.status().is_success() => {
                    return resp
                        .json::<R>()
                        .await
                        .map_err(|e| ScorerError::ScorerInvalidResponse(e.to_string()));
                }
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    if attempt + 1 == self.max_retries {
                        return Err(ScorerError::ScorerUnavailable(format!(
                            "{} returned {}",
                            path, status
                        )));
                    }
                    warn!(path, %status, attempt, "scorer returned non-success, retrying");
                }
                Ok(Err(e)) => {
                    if attempt + 1 == self.max_retries {
                        return Err(ScorerError::ScorerUnavailable(e.to_string()));
                    }
                    warn!(path, attempt, error = %e, "scorer request failed, retrying");
                }
                Err(_) => {
                    if attempt + 1 == self.max_retries {
                        return Err(ScorerError::Timeout);
                    }
                    warn!(path, attempt, "scorer call timed out, retrying");
                }
            }

            let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
            tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
        }

        Err(ScorerError::ScorerUnavailable(format!(
            "max retries exceeded for {}",
            path
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_constructs_with_configured_deadline() {
        let c = ScorerClient::new("http://localhost:9500".into(), 2_000, 3);
        assert_eq!(c.deadline, Duration::from_millis(2_000));
        assert_eq!(c.max_retries, 3);
    }
}
