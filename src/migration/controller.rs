//! Entry point while the migration is in progress.
//!
//! Every inbound message goes through [`MigrationController::handle`],
//! which asks the [`TrafficRouter`] who should answer, runs the chosen
//! implementation(s), feeds [`HealthMetrics`] and, in shadow mode, diffs
//! both outputs. Whatever goes wrong, the caller gets a result.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{MigrationError, PipelineError};
use crate::migration::Implementation;
use crate::migration::comparator::{ComparisonResult, ResponseComparator};
use crate::migration::health::{CallSample, HealthMetrics, HealthSnapshot};
use crate::migration::router::{RollbackEvent, RolloutMode, RoutingConfig, TrafficRouter};
use crate::pipeline::types::{InboundMessage, MessageHandler, PipelineResult};
use crate::store::Database;

/// Comparisons returned by the status endpoint.
const STATUS_COMPARISONS: usize = 10;

/// Result handed back to the webhook caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerResponse {
    #[serde(flatten)]
    pub result: PipelineResult,
    /// Implementation whose payload is returned.
    pub implementation: Implementation,
    pub routing_reason: String,
    /// Both ran and their outputs were compared.
    pub shadow_compared: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<ComparisonResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub config: RoutingConfig,
    pub legacy: HealthSnapshot,
    pub new: HealthSnapshot,
    pub recent_rollbacks: Vec<RollbackEvent>,
    pub recent_comparisons: Vec<ComparisonResult>,
}

pub struct MigrationController {
    legacy: Arc<dyn MessageHandler>,
    new: Arc<dyn MessageHandler>,
    router: Arc<TrafficRouter>,
    comparator: ResponseComparator,
    store: Option<Arc<dyn Database>>,
}

impl MigrationController {
    pub fn new(
        legacy: Arc<dyn MessageHandler>,
        new: Arc<dyn MessageHandler>,
        router: Arc<TrafficRouter>,
    ) -> Self {
        Self {
            legacy,
            new,
            router,
            comparator: ResponseComparator::default(),
            store: None,
        }
    }

    /// Persist comparison results (best-effort).
    pub fn with_store(mut self, store: Arc<dyn Database>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn router(&self) -> &Arc<TrafficRouter> {
        &self.router
    }

    fn health(&self) -> &Arc<HealthMetrics> {
        self.router.health()
    }

    /// Route one message. Falls back to legacy alone on any dispatch failure.
    pub async fn handle(&self, message: &InboundMessage) -> ControllerResponse {
        let correlation_id = message.correlation_id().unwrap_or_else(Uuid::new_v4);

        match self.dispatch(message, correlation_id).await {
            Ok(response) => response,
            Err(e) => {
                let fresh = Uuid::new_v4();
                tracing::error!(
                    correlation_id = %correlation_id,
                    fallback_correlation_id = %fresh,
                    error_kind = e.kind(),
                    "Migration dispatch failed, running legacy alone: {e}"
                );
                let result = run_recorded(
                    Arc::clone(&self.legacy),
                    self.health(),
                    Implementation::Legacy,
                    RunMode::Live,
                    message,
                    fresh,
                )
                .await;
                ControllerResponse {
                    result,
                    implementation: Implementation::Legacy,
                    routing_reason: format!("routing_fallback: {e}"),
                    shadow_compared: false,
                    comparison: None,
                }
            }
        }
    }

    async fn dispatch(
        &self,
        message: &InboundMessage,
        correlation_id: Uuid,
    ) -> Result<ControllerResponse, PipelineError> {
        let decision = self.router.route(&message.contact, correlation_id).await;

        match decision.implementation {
            Implementation::Legacy | Implementation::New => {
                let handler = match decision.implementation {
                    Implementation::New => Arc::clone(&self.new),
                    _ => Arc::clone(&self.legacy),
                };
                let result = self
                    .spawn_recorded(handler, decision.implementation, RunMode::Live, message, correlation_id)
                    .await
                    .map_err(|e| task_failed(decision.implementation, e))?;
                Ok(ControllerResponse {
                    result,
                    implementation: decision.implementation,
                    routing_reason: decision.reason,
                    shadow_compared: false,
                    comparison: None,
                })
            }
            Implementation::Both => {
                let legacy = self.spawn_recorded(
                    Arc::clone(&self.legacy),
                    Implementation::Legacy,
                    RunMode::Live,
                    message,
                    correlation_id,
                );
                // Legacy answers the contact; new only runs dry for the diff.
                let new = self.spawn_recorded(
                    Arc::clone(&self.new),
                    Implementation::New,
                    RunMode::Shadow,
                    message,
                    correlation_id,
                );
                let (legacy, new) = futures::future::join(legacy, new).await;

                let legacy = legacy.map_err(|e| task_failed(Implementation::Legacy, e))?;
                let new = match new {
                    Ok(result) => result,
                    Err(e) => {
                        let err = task_failed(Implementation::New, e);
                        tracing::warn!(correlation_id = %correlation_id, "Shadow call failed: {err}");
                        PipelineResult::failure(correlation_id, 0, err.to_string())
                    }
                };

                let comparison = (legacy.success && new.success)
                    .then(|| self.comparator.compare(correlation_id, &legacy, &new));

                if let Some(cmp) = &comparison {
                    if cmp.actionable {
                        tracing::warn!(
                            correlation_id = %correlation_id,
                            severity = cmp.severity.as_str(),
                            differences = cmp.details.len(),
                            "Shadow comparison found actionable differences"
                        );
                    }
                    self.store_comparison(cmp);
                }

                Ok(ControllerResponse {
                    result: legacy,
                    implementation: Implementation::Legacy,
                    routing_reason: decision.reason,
                    shadow_compared: comparison.is_some(),
                    comparison,
                })
            }
        }
    }

    /// Run one implementation on its own task so a panic in it cannot take
    /// down the other shadow call.
    fn spawn_recorded(
        &self,
        handler: Arc<dyn MessageHandler>,
        implementation: Implementation,
        mode: RunMode,
        message: &InboundMessage,
        correlation_id: Uuid,
    ) -> JoinHandle<PipelineResult> {
        let health = Arc::clone(self.health());
        let message = message.clone();
        tokio::spawn(async move {
            run_recorded(handler, &health, implementation, mode, &message, correlation_id).await
        })
    }

    fn store_comparison(&self, comparison: &ComparisonResult) {
        let Some(store) = &self.store else {
            return;
        };
        let store = Arc::clone(store);
        let comparison = comparison.clone();
        tokio::spawn(async move {
            if let Err(e) = store.record_comparison(&comparison).await {
                tracing::warn!(
                    correlation_id = %comparison.correlation_id,
                    "Failed to store comparison: {e}"
                );
            }
        });
    }

    // ── Status & administration ─────────────────────────────────────

    pub async fn status(&self) -> MigrationStatus {
        let recent_comparisons = match &self.store {
            Some(store) => store
                .recent_comparisons(STATUS_COMPARISONS)
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!("Failed to load recent comparisons: {e}");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        MigrationStatus {
            config: self.router.config(),
            legacy: self.health().snapshot(Implementation::Legacy).await,
            new: self.health().snapshot(Implementation::New).await,
            recent_rollbacks: self.router.recent_rollbacks().await,
            recent_comparisons,
        }
    }

    pub fn set_rollout(
        &self,
        percentage: u8,
        mode: RolloutMode,
    ) -> Result<RoutingConfig, MigrationError> {
        self.router.set_rollout(percentage, mode)
    }

    /// Manual rollback to 0% and a fresh health window for the new implementation.
    pub async fn rollback(&self, reason: &str) -> RoutingConfig {
        let config = self.router.manual_rollback(reason).await;
        self.health().reset(Implementation::New).await;
        config
    }

    pub fn toggle_shadow(&self, enabled: bool) -> RoutingConfig {
        self.router.toggle_shadow(enabled)
    }
}

/// How a handler is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    /// Authoritative: replies and persists.
    Live,
    /// Comparison only: no side effects.
    Shadow,
}

async fn run_recorded(
    handler: Arc<dyn MessageHandler>,
    health: &HealthMetrics,
    implementation: Implementation,
    mode: RunMode,
    message: &InboundMessage,
    correlation_id: Uuid,
) -> PipelineResult {
    let start = Instant::now();
    let result = match mode {
        RunMode::Live => handler.handle(message, correlation_id).await,
        RunMode::Shadow => handler.handle_shadow(message, correlation_id).await,
    };
    let latency_ms = start.elapsed().as_millis() as u64;

    let sample = if result.success {
        CallSample::success(latency_ms)
    } else {
        CallSample::failure(
            latency_ms,
            result.error.clone().unwrap_or_else(|| "unknown error".into()),
        )
    };
    health.record(implementation, sample).await;
    result
}

fn task_failed(implementation: Implementation, e: tokio::task::JoinError) -> PipelineError {
    let err = MigrationError::TaskFailed {
        implementation: implementation.to_string(),
        reason: e.to_string(),
    };
    PipelineError::RoutingFallback(err.to_string())
}
