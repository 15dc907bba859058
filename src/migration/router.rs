//! Traffic splitting between the legacy and the new implementation.
//!
//! The routing configuration is an immutable snapshot held in an
//! [`ArcSwap`]. Readers load it without locking; operator changes and
//! automatic rollbacks replace it with read-copy-update, so concurrent
//! writers never lose each other's changes.

use std::collections::VecDeque;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::MigrationError;
use crate::migration::Implementation;
use crate::migration::health::{HealthMetrics, HealthSnapshot};
use crate::phone::PhoneNormalizer;

/// Rollback events kept for the status endpoint.
pub const MAX_ROLLBACK_EVENTS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutMode {
    /// Both implementations run; legacy answers.
    Shadow,
    /// A stable percentage of contacts goes to the new implementation.
    Active,
    /// Every contact goes to the new implementation.
    Full,
}

impl RolloutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shadow => "shadow",
            Self::Active => "active",
            Self::Full => "full",
        }
    }
}

impl std::str::FromStr for RolloutMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shadow" => Ok(Self::Shadow),
            "active" => Ok(Self::Active),
            "full" => Ok(Self::Full),
            other => Err(format!("unknown rollout mode: {other}")),
        }
    }
}

/// Limits that force traffic back to legacy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutoRollbackConfig {
    pub enabled: bool,
    pub max_error_rate: f64,
    pub max_p95_latency_ms: u64,
    pub max_consecutive_failures: u32,
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_error_rate: 0.05,
            max_p95_latency_ms: 1000,
            max_consecutive_failures: 5,
        }
    }
}

impl AutoRollbackConfig {
    /// Describe the first breached limit, if any.
    fn breach(&self, health: &HealthSnapshot) -> Option<String> {
        if health.requests_in_window == 0 {
            return None;
        }
        if health.error_rate > self.max_error_rate {
            return Some(format!(
                "error rate {:.3} above {:.3}",
                health.error_rate, self.max_error_rate
            ));
        }
        if health.p95_latency_ms > self.max_p95_latency_ms {
            return Some(format!(
                "p95 latency {}ms above {}ms",
                health.p95_latency_ms, self.max_p95_latency_ms
            ));
        }
        if health.consecutive_failures >= self.max_consecutive_failures {
            return Some(format!(
                "{} consecutive failures",
                health.consecutive_failures
            ));
        }
        None
    }
}

/// Immutable routing configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Share of contacts (0..=100) routed to the new implementation in active mode.
    pub percentage: u8,
    pub mode: RolloutMode,
    pub auto_rollback: AutoRollbackConfig,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            percentage: 0,
            mode: RolloutMode::Active,
            auto_rollback: AutoRollbackConfig::default(),
        }
    }
}

impl RoutingConfig {
    /// Nothing reaches the new implementation.
    fn is_rolled_back(&self) -> bool {
        self.mode == RolloutMode::Active && self.percentage == 0
    }
}

/// Which implementation handles one message, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub implementation: Implementation,
    pub reason: String,
    pub correlation_id: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackTrigger {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    pub at: DateTime<Utc>,
    pub trigger: RollbackTrigger,
    pub reason: String,
    pub previous_percentage: u8,
    pub previous_mode: RolloutMode,
}

/// Stable bucket in `0..100` for a contact key.
pub fn bucket_for(key: &str) -> u8 {
    let digest = Sha256::digest(key.as_bytes());
    let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (prefix % 100) as u8
}

pub struct TrafficRouter {
    config: ArcSwap<RoutingConfig>,
    health: Arc<HealthMetrics>,
    normalizer: PhoneNormalizer,
    rollbacks: RwLock<VecDeque<RollbackEvent>>,
}

impl TrafficRouter {
    pub fn new(config: RoutingConfig, health: Arc<HealthMetrics>) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            health,
            normalizer: PhoneNormalizer::default(),
            rollbacks: RwLock::new(VecDeque::new()),
        }
    }

    pub fn with_normalizer(mut self, normalizer: PhoneNormalizer) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> RoutingConfig {
        self.config.load().as_ref().clone()
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Decide who handles a message. Never fails: routing errors pick legacy.
    pub async fn route(&self, contact: &str, correlation_id: Uuid) -> RoutingDecision {
        match self.try_route(contact, correlation_id).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(correlation_id = %correlation_id, "Routing failed, using legacy: {e}");
                RoutingDecision {
                    implementation: Implementation::Legacy,
                    reason: format!("routing_fallback: {e}"),
                    correlation_id,
                }
            }
        }
    }

    async fn try_route(
        &self,
        contact: &str,
        correlation_id: Uuid,
    ) -> Result<RoutingDecision, MigrationError> {
        let config = self.config.load_full();
        let decide = |implementation, reason: String| RoutingDecision {
            implementation,
            reason,
            correlation_id,
        };

        if config.auto_rollback.enabled && !config.is_rolled_back() {
            let health = self.health.snapshot(Implementation::New).await;
            if let Some(breach) = config.auto_rollback.breach(&health) {
                self.rollback(RollbackTrigger::Automatic, &breach).await;
                return Ok(decide(
                    Implementation::Legacy,
                    format!("auto_rollback: {breach}"),
                ));
            }
        }

        let decision = match config.mode {
            RolloutMode::Shadow => decide(Implementation::Both, "shadow_mode".into()),
            RolloutMode::Full => decide(Implementation::New, "full_rollout".into()),
            RolloutMode::Active => {
                let bucket = self.bucket(contact)?;
                if bucket < config.percentage {
                    decide(
                        Implementation::New,
                        format!("bucket {bucket} < {}%", config.percentage),
                    )
                } else {
                    decide(
                        Implementation::Legacy,
                        format!("bucket {bucket} >= {}%", config.percentage),
                    )
                }
            }
        };

        tracing::debug!(
            correlation_id = %correlation_id,
            implementation = %decision.implementation,
            reason = %decision.reason,
            "Routing decision"
        );
        Ok(decision)
    }

    /// Bucket a contact on its normalized form, so formatting differences
    /// never move a contact between implementations.
    fn bucket(&self, contact: &str) -> Result<u8, MigrationError> {
        let trimmed = contact.trim();
        if trimmed.is_empty() {
            return Err(MigrationError::Bucketing("empty contact".into()));
        }
        let key = self
            .normalizer
            .normalize(trimmed)
            .unwrap_or_else(|_| trimmed.to_string());
        Ok(bucket_for(&key))
    }

    // ── Administrative operations ───────────────────────────────────

    pub fn set_rollout(
        &self,
        percentage: u8,
        mode: RolloutMode,
    ) -> Result<RoutingConfig, MigrationError> {
        if percentage > 100 {
            return Err(MigrationError::InvalidPercentage(percentage.into()));
        }
        self.config.rcu(|current| RoutingConfig {
            percentage,
            mode,
            ..current.as_ref().clone()
        });
        tracing::info!(percentage, mode = mode.as_str(), "Rollout updated");
        Ok(self.config())
    }

    /// Enter shadow mode, or leave it back to active at the current percentage.
    pub fn toggle_shadow(&self, enabled: bool) -> RoutingConfig {
        self.config.rcu(|current| RoutingConfig {
            mode: if enabled {
                RolloutMode::Shadow
            } else {
                RolloutMode::Active
            },
            ..current.as_ref().clone()
        });
        tracing::info!(enabled, "Shadow mode toggled");
        self.config()
    }

    pub fn set_auto_rollback(&self, enabled: bool) -> RoutingConfig {
        self.config.rcu(|current| {
            let mut next = current.as_ref().clone();
            next.auto_rollback.enabled = enabled;
            next
        });
        self.config()
    }

    /// Operator-requested rollback to 0% active.
    pub async fn manual_rollback(&self, reason: &str) -> RoutingConfig {
        self.rollback(RollbackTrigger::Manual, reason).await;
        self.config()
    }

    async fn rollback(&self, trigger: RollbackTrigger, reason: &str) {
        let previous = self.config.rcu(|current| RoutingConfig {
            percentage: 0,
            mode: RolloutMode::Active,
            ..current.as_ref().clone()
        });

        // Concurrent breaches all see the same pre-rollback config; only
        // the one that actually changed it records an event.
        if previous.is_rolled_back() && trigger == RollbackTrigger::Automatic {
            return;
        }

        tracing::warn!(
            trigger = ?trigger,
            previous_percentage = previous.percentage,
            previous_mode = previous.mode.as_str(),
            reason,
            "Traffic rolled back to legacy"
        );

        let mut events = self.rollbacks.write().await;
        events.push_back(RollbackEvent {
            at: Utc::now(),
            trigger,
            reason: reason.to_string(),
            previous_percentage: previous.percentage,
            previous_mode: previous.mode,
        });
        while events.len() > MAX_ROLLBACK_EVENTS {
            events.pop_front();
        }
    }

    /// Most recent rollback events, oldest first.
    pub async fn recent_rollbacks(&self) -> Vec<RollbackEvent> {
        self.rollbacks.read().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::health::CallSample;

    fn router(config: RoutingConfig) -> TrafficRouter {
        let health = Arc::new(HealthMetrics::new(chrono::Duration::minutes(10)));
        TrafficRouter::new(config, health)
    }

    fn active(percentage: u8) -> RoutingConfig {
        RoutingConfig {
            percentage,
            mode: RolloutMode::Active,
            auto_rollback: AutoRollbackConfig::default(),
        }
    }

    #[test]
    fn bucket_is_deterministic_and_in_range() {
        let a = bucket_for("+5491111111111");
        assert_eq!(a, bucket_for("+5491111111111"));
        for i in 0..500 {
            assert!(bucket_for(&format!("+54911{i:08}")) < 100);
        }
    }

    #[tokio::test]
    async fn same_contact_same_decision() {
        let r = router(active(30));
        let first = r.route("+5491111111111", Uuid::new_v4()).await;
        let second = r.route("+5491111111111", Uuid::new_v4()).await;
        assert_eq!(first.implementation, second.implementation);
        assert_ne!(first.implementation, Implementation::Both);
    }

    #[tokio::test]
    async fn formatting_does_not_change_bucket() {
        let r = router(active(50));
        let canonical = r.route("+5491111111111", Uuid::new_v4()).await;
        let formatted = r.route("+54 9 11 1111-1111", Uuid::new_v4()).await;
        assert_eq!(canonical.implementation, formatted.implementation);
    }

    #[tokio::test]
    async fn percentage_splits_roughly() {
        let r = router(active(30));
        let mut new_count = 0;
        for i in 0..1000 {
            let d = r.route(&format!("+54911{i:08}"), Uuid::new_v4()).await;
            if d.implementation == Implementation::New {
                new_count += 1;
            }
        }
        assert!((200..400).contains(&new_count), "got {new_count}");
    }

    #[tokio::test]
    async fn zero_and_hundred_percent() {
        let r = router(active(0));
        assert_eq!(
            r.route("+5491111111111", Uuid::new_v4()).await.implementation,
            Implementation::Legacy
        );
        r.set_rollout(100, RolloutMode::Active).unwrap();
        assert_eq!(
            r.route("+5491111111111", Uuid::new_v4()).await.implementation,
            Implementation::New
        );
    }

    #[tokio::test]
    async fn shadow_and_full_modes() {
        let r = router(active(0));
        r.toggle_shadow(true);
        assert_eq!(
            r.route("+5491111111111", Uuid::new_v4()).await.implementation,
            Implementation::Both
        );
        r.set_rollout(0, RolloutMode::Full).unwrap();
        assert_eq!(
            r.route("+5491111111111", Uuid::new_v4()).await.implementation,
            Implementation::New
        );
        r.toggle_shadow(false);
        assert_eq!(r.config().mode, RolloutMode::Active);
    }

    #[tokio::test]
    async fn invalid_percentage_rejected() {
        let r = router(active(10));
        let err = r.set_rollout(101, RolloutMode::Active).unwrap_err();
        assert!(matches!(err, MigrationError::InvalidPercentage(101)));
        assert_eq!(r.config().percentage, 10);
    }

    #[tokio::test]
    async fn empty_contact_falls_back_to_legacy() {
        let r = router(active(100));
        let d = r.route("   ", Uuid::new_v4()).await;
        assert_eq!(d.implementation, Implementation::Legacy);
        assert!(d.reason.starts_with("routing_fallback"));
    }

    #[tokio::test]
    async fn error_rate_breach_rolls_back() {
        let r = router(active(100));
        for _ in 0..9 {
            r.health().record(Implementation::New, CallSample::success(10)).await;
        }
        r.health()
            .record(Implementation::New, CallSample::failure(10, "boom"))
            .await;

        let d = r.route("+5491111111111", Uuid::new_v4()).await;
        assert_eq!(d.implementation, Implementation::Legacy);
        assert!(d.reason.starts_with("auto_rollback"));

        let config = r.config();
        assert_eq!(config.percentage, 0);
        assert_eq!(config.mode, RolloutMode::Active);

        let events = r.recent_rollbacks().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, RollbackTrigger::Automatic);
        assert_eq!(events[0].previous_percentage, 100);

        // Already rolled back: further routing does not add events.
        r.route("+5491111111111", Uuid::new_v4()).await;
        assert_eq!(r.recent_rollbacks().await.len(), 1);
    }

    #[tokio::test]
    async fn shadow_mode_also_rolls_back() {
        let r = router(RoutingConfig {
            mode: RolloutMode::Shadow,
            ..active(0)
        });
        for _ in 0..5 {
            r.health()
                .record(Implementation::New, CallSample::failure(10, "boom"))
                .await;
        }
        let d = r.route("+5491111111111", Uuid::new_v4()).await;
        assert_eq!(d.implementation, Implementation::Legacy);
        assert_eq!(r.config().mode, RolloutMode::Active);
    }

    #[tokio::test]
    async fn disabled_auto_rollback_ignores_health() {
        let r = router(active(100));
        r.set_auto_rollback(false);
        for _ in 0..10 {
            r.health()
                .record(Implementation::New, CallSample::failure(10, "boom"))
                .await;
        }
        let d = r.route("+5491111111111", Uuid::new_v4()).await;
        assert_eq!(d.implementation, Implementation::New);
    }

    #[tokio::test]
    async fn manual_rollback_is_recorded() {
        let r = router(active(40));
        let config = r.manual_rollback("operator").await;
        assert_eq!(config.percentage, 0);
        let events = r.recent_rollbacks().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].trigger, RollbackTrigger::Manual);
        assert_eq!(events[0].reason, "operator");
    }

    #[tokio::test]
    async fn rollback_log_is_bounded() {
        let r = router(active(40));
        for i in 0..(MAX_ROLLBACK_EVENTS + 5) {
            r.manual_rollback(&format!("r{i}")).await;
        }
        let events = r.recent_rollbacks().await;
        assert_eq!(events.len(), MAX_ROLLBACK_EVENTS);
        assert_eq!(events.last().unwrap().reason, format!("r{}", MAX_ROLLBACK_EVENTS + 4));
    }

    #[test]
    fn mode_parses() {
        assert_eq!("Shadow".parse::<RolloutMode>().unwrap(), RolloutMode::Shadow);
        assert!("canary".parse::<RolloutMode>().is_err());
    }
}
