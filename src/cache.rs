//! Scored-Prediction Cache (C2)
//!
//! Fronts the ML scorer with a bounded TTL cache keyed on
//! (race, runner, strategy, model version). `get`/`set` are safe under
//! concurrent access; `get_or_compute` coalesces concurrent misses for the
//! same fingerprint onto a single in-flight call, a QoS goal rather than a
//! hard invariant (two racing misses before the first's `watch` channel is
//! registered may both compute — acceptable).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub race_id: i64,
    pub runner_id: i64,
    pub strategy_id: i64,
    pub model_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionResult {
    pub probability: f64,
    pub confidence: f64,
    pub model_version: String,
}

struct Entry {
    value: PredictionResult,
    inserted_at: Instant,
}

pub struct PredictionCache {
    ttl: Duration,
    capacity: usize,
    ready: Mutex<HashMap<Fingerprint, Entry>>,
    in_flight: Mutex<HashMap<Fingerprint, watch::Sender<Option<PredictionResult>>>>,
}

impl PredictionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            ready: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &Fingerprint) -> Option<PredictionResult> {
        let mut ready = self.ready.lock();
        match ready.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                ready.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: Fingerprint, value: PredictionResult) {
        let mut ready = self.ready.lock();
        self.evict_if_full(&mut ready, &key);
        ready.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Removes every cached entry for `strategy_id`. Called after a
    /// successful `SubmitFeedback` for that strategy (P6, scenario 6).
    pub fn invalidate_strategy(&self, strategy_id: i64) {
        let mut ready = self.ready.lock();
        ready.retain(|k, _| k.strategy_id != strategy_id);
    }

    fn evict_if_full(&self, ready: &mut HashMap<Fingerprint, Entry>, incoming: &Fingerprint) {
        if ready.len() < self.capacity || ready.contains_key(incoming) {
            return;
        }
        let expired_key = ready
            .iter()
            .find(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone());
        let victim = expired_key.or_else(|| {
            ready
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
        });
        if let Some(k) = victim {
            ready.remove(&k);
        }
    }

    /// Get-or-compute with in-flight coalescing: the first caller for a
    /// fingerprint runs `compute`; subsequent concurrent callers await its
    /// result instead of issuing a second RPC.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: Fingerprint,
        compute: F,
    ) -> anyhow::Result<PredictionResult>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<PredictionResult>>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }

        let (is_leader, mut rx) = {
            let mut in_flight = self.in_flight.lock();
            if let Some(tx) = in_flight.get(&key) {
                (false, tx.subscribe())
            } else {
                let (tx, rx) = watch::channel(None);
                in_flight.insert(key.clone(), tx);
                (true, rx)
            }
        };

        if !is_leader {
            loop {
                if let Some(v) = rx.borrow().clone() {
                    return Ok(v);
                }
                if rx.changed().await.is_err() {
                    // Leader's sender dropped without ever sending (its
                    // compute errored); recheck the ready cache once more,
                    // otherwise report the same class of failure upward.
                    return self
                        .get(&key)
                        .ok_or_else(|| anyhow::anyhow!("leader computation for fingerprint failed"));
                }
            }
        }

        let result = compute().await;
        {
            let mut ready = self.ready.lock();
            if let Ok(v) = &result {
                self.evict_if_full(&mut ready, &key);
                ready.insert(
                    key.clone(),
                    Entry {
                        value: v.clone(),
                        inserted_at: Instant::now(),
                    },
                );
            }
        }
        if let Some(tx) = self.in_flight.lock().remove(&key) {
            if let Ok(v) = &result {
                let _ = tx.send(Some(v.clone()));
            }
            // Dropping `tx` on error notifies waiters' `changed()` with an
            // error, which they interpret as "the leader failed".
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(strategy_id: i64) -> Fingerprint {
        Fingerprint {
            race_id: 1,
            runner_id: 2,
            strategy_id,
            model_version: "v1".to_string(),
        }
    }

    fn pred() -> PredictionResult {
        PredictionResult {
            probability: 0.3,
            confidence: 0.8,
            model_version: "v1".to_string(),
        }
    }

    // P6: Get(k) after Set(k, v) within TTL returns v.
    #[test]
    fn get_after_set_within_ttl() {
        let c = PredictionCache::new(Duration::from_secs(60), 100);
        c.set(fp(1), pred());
        assert_eq!(c.get(&fp(1)), Some(pred()));
    }

    #[test]
    fn get_after_ttl_expiry_misses() {
        let c = PredictionCache::new(Duration::from_millis(1), 100);
        c.set(fp(1), pred());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(c.get(&fp(1)), None);
    }

    // P6: after Invalidate(strategy), all keys with that strategy miss.
    #[test]
    fn invalidate_strategy_clears_only_its_keys() {
        let c = PredictionCache::new(Duration::from_secs(60), 100);
        c.set(fp(1), pred());
        c.set(fp(2), pred());
        c.invalidate_strategy(1);
        assert_eq!(c.get(&fp(1)), None);
        assert_eq!(c.get(&fp(2)), Some(pred()));
    }

    #[tokio::test]
    async fn get_or_compute_caches_result() {
        let c = PredictionCache::new(Duration::from_secs(60), 100);
        let v = c.get_or_compute(fp(1), || async { Ok(pred()) }).await.unwrap();
        assert_eq!(v, pred());
        assert_eq!(c.get(&fp(1)), Some(pred()));
    }
}
