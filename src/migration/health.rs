//! Sliding-window health metrics per implementation.
//!
//! Each implementation keeps a bounded ring of recent call outcomes. Old
//! samples are pruned by age on every write and ignored on every read, so
//! snapshots always describe the configured window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::migration::Implementation;
use crate::store::Database;

/// Upper bound on the consecutive-failure scan.
pub const MAX_CONSECUTIVE_SCAN: u32 = 20;

/// Default ring capacity per implementation.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Outcome of one call to an implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSample {
    pub at: DateTime<Utc>,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(default)]
    pub error: Option<String>,
}

impl CallSample {
    pub fn success(latency_ms: u64) -> Self {
        Self {
            at: Utc::now(),
            success: true,
            latency_ms,
            error: None,
        }
    }

    pub fn failure(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            success: false,
            latency_ms,
            error: Some(error.into()),
        }
    }

    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.at = at;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time view of one implementation's window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub error_rate: f64,
    pub p95_latency_ms: u64,
    pub requests_in_window: usize,
    pub consecutive_failures: u32,
}

impl HealthSnapshot {
    fn empty() -> Self {
        Self {
            status: HealthStatus::Healthy,
            error_rate: 0.0,
            p95_latency_ms: 0,
            requests_in_window: 0,
            consecutive_failures: 0,
        }
    }
}

/// Status classification limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub unhealthy_error_rate: f64,
    pub unhealthy_p95_ms: u64,
    pub unhealthy_consecutive: u32,
    pub degraded_error_rate: f64,
    pub degraded_p95_ms: u64,
    pub degraded_consecutive: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            unhealthy_error_rate: 0.05,
            unhealthy_p95_ms: 1000,
            unhealthy_consecutive: 5,
            degraded_error_rate: 0.01,
            degraded_p95_ms: 500,
            degraded_consecutive: 3,
        }
    }
}

impl HealthThresholds {
    fn classify(&self, error_rate: f64, p95: u64, consecutive: u32) -> HealthStatus {
        if error_rate > self.unhealthy_error_rate
            || p95 > self.unhealthy_p95_ms
            || consecutive >= self.unhealthy_consecutive
        {
            HealthStatus::Unhealthy
        } else if error_rate > self.degraded_error_rate
            || p95 > self.degraded_p95_ms
            || consecutive >= self.degraded_consecutive
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Nearest-rank p95 of the given latencies.
fn p95(latencies: &mut [u64]) -> u64 {
    if latencies.is_empty() {
        return 0;
    }
    latencies.sort_unstable();
    // ceil(0.95 * n) in integer arithmetic
    let rank = (latencies.len() * 95).div_ceil(100);
    latencies[rank.saturating_sub(1).min(latencies.len() - 1)]
}

/// Compute a snapshot over samples ordered oldest to newest.
fn compute_snapshot(samples: &[&CallSample], thresholds: &HealthThresholds) -> HealthSnapshot {
    if samples.is_empty() {
        return HealthSnapshot::empty();
    }

    let total = samples.len();
    let failures = samples.iter().filter(|s| !s.success).count();
    let error_rate = failures as f64 / total as f64;

    let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
    let p95_latency_ms = p95(&mut latencies);

    let consecutive_failures = samples
        .iter()
        .rev()
        .take(MAX_CONSECUTIVE_SCAN as usize)
        .take_while(|s| !s.success)
        .count() as u32;

    HealthSnapshot {
        status: thresholds.classify(error_rate, p95_latency_ms, consecutive_failures),
        error_rate,
        p95_latency_ms,
        requests_in_window: total,
        consecutive_failures,
    }
}

/// Insert-only health aggregator shared by the router and the controller.
pub struct HealthMetrics {
    window: chrono::Duration,
    capacity: usize,
    thresholds: HealthThresholds,
    samples: RwLock<HashMap<Implementation, VecDeque<CallSample>>>,
    store: Option<Arc<dyn Database>>,
}

impl HealthMetrics {
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            capacity: DEFAULT_CAPACITY,
            thresholds: HealthThresholds::default(),
            samples: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn with_thresholds(mut self, thresholds: HealthThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    /// Also write every sample to the store (best-effort, in the background).
    pub fn with_store(mut self, store: Arc<dyn Database>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn window(&self) -> chrono::Duration {
        self.window
    }

    /// Record one call outcome.
    pub async fn record(&self, implementation: Implementation, sample: CallSample) {
        if implementation == Implementation::Both {
            tracing::warn!("Health samples are recorded per implementation, ignoring 'both'");
            return;
        }

        if let Some(store) = &self.store {
            let store = Arc::clone(store);
            let persisted = sample.clone();
            tokio::spawn(async move {
                if let Err(e) = store.record_health_sample(implementation, &persisted).await {
                    tracing::debug!(implementation = %implementation, "Health sample not persisted: {e}");
                }
            });
        }

        let cutoff = sample.at - self.window;
        let mut samples = self.samples.write().await;
        let ring = samples.entry(implementation).or_default();
        ring.push_back(sample);
        while ring.front().is_some_and(|s| s.at < cutoff) {
            ring.pop_front();
        }
        while ring.len() > self.capacity {
            ring.pop_front();
        }
    }

    /// Snapshot of the window ending now.
    pub async fn snapshot(&self, implementation: Implementation) -> HealthSnapshot {
        self.snapshot_at(implementation, Utc::now()).await
    }

    /// Snapshot of the window ending at `now`.
    pub async fn snapshot_at(
        &self,
        implementation: Implementation,
        now: DateTime<Utc>,
    ) -> HealthSnapshot {
        let cutoff = now - self.window;
        let samples = self.samples.read().await;
        let Some(ring) = samples.get(&implementation) else {
            return HealthSnapshot::empty();
        };
        let in_window: Vec<&CallSample> = ring.iter().filter(|s| s.at >= cutoff).collect();
        compute_snapshot(&in_window, &self.thresholds)
    }

    /// Drop every sample (used after a manual rollback).
    pub async fn reset(&self, implementation: Implementation) {
        self.samples.write().await.remove(&implementation);
    }
}
