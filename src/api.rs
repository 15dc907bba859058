//! HTTP surface: inbound webhook, health and migration controls.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::MigrationError;
use crate::migration::{MigrationController, RolloutMode};
use crate::pipeline::RouterPipeline;
use crate::pipeline::types::InboundMessage;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RouterPipeline>,
    /// Set while the migration layer is active; messages then go through it.
    pub controller: Option<Arc<MigrationController>>,
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/messages", post(receive_message))
        .route("/api/migration/status", get(migration_status))
        .route("/api/migration/rollout", post(set_rollout))
        .route("/api/migration/rollback", post(rollback))
        .route("/api/migration/shadow", post(toggle_shadow))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_body(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"success": false, "error": error.into()})),
    )
        .into_response()
}

fn migration_disabled() -> Response {
    error_body(StatusCode::NOT_FOUND, "Migration layer not configured")
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "lead-router",
        "migration": state.controller.is_some(),
    }))
}

// ── Webhook ─────────────────────────────────────────────────────────────

/// Reject payloads nothing can be routed from.
fn validate(message: &InboundMessage) -> Result<(), &'static str> {
    if message.contact.trim().is_empty() {
        return Err("contact is required");
    }
    if message.text.trim().is_empty() && message.media.is_none() {
        return Err("message has neither text nor media");
    }
    Ok(())
}

async fn receive_message(
    State(state): State<AppState>,
    payload: Result<Json<InboundMessage>, JsonRejection>,
) -> Response {
    let message = match payload {
        Ok(Json(message)) => message,
        Err(rejection) => {
            debug!(error = %rejection, "Malformed webhook payload");
            return error_body(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if let Err(reason) = validate(&message) {
        return error_body(StatusCode::BAD_REQUEST, reason);
    }

    if let Some(ref controller) = state.controller {
        let response = controller.handle(&message).await;
        return (StatusCode::OK, Json(response)).into_response();
    }

    let correlation_id = message.correlation_id().unwrap_or_else(Uuid::new_v4);
    let result = state.pipeline.process(&message, correlation_id).await;
    (StatusCode::OK, Json(result)).into_response()
}

// ── Migration controls ──────────────────────────────────────────────────

async fn migration_status(State(state): State<AppState>) -> Response {
    match state.controller {
        Some(controller) => Json(controller.status().await).into_response(),
        None => migration_disabled(),
    }
}

#[derive(Deserialize)]
struct RolloutRequest {
    percentage: u32,
    /// Keeps the current mode when omitted.
    mode: Option<RolloutMode>,
}

async fn set_rollout(
    State(state): State<AppState>,
    payload: Result<Json<RolloutRequest>, JsonRejection>,
) -> Response {
    let Some(controller) = state.controller else {
        return migration_disabled();
    };
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    let mode = body
        .mode
        .unwrap_or_else(|| controller.router().config().mode);
    let applied = u8::try_from(body.percentage)
        .map_err(|_| MigrationError::InvalidPercentage(body.percentage))
        .and_then(|percentage| controller.set_rollout(percentage, mode));
    match applied {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_body(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

#[derive(Deserialize, Default)]
struct RollbackRequest {
    reason: Option<String>,
}

async fn rollback(
    State(state): State<AppState>,
    body: Option<Json<RollbackRequest>>,
) -> Response {
    let Some(controller) = state.controller else {
        return migration_disabled();
    };
    let Json(body) = body.unwrap_or_default();
    let reason = body.reason.unwrap_or_else(|| "operator request".to_string());
    warn!(reason = %reason, "Manual rollback requested");
    Json(controller.rollback(&reason).await).into_response()
}

#[derive(Deserialize)]
struct ShadowRequest {
    enabled: bool,
}

async fn toggle_shadow(
    State(state): State<AppState>,
    payload: Result<Json<ShadowRequest>, JsonRejection>,
) -> Response {
    let Some(controller) = state.controller else {
        return migration_disabled();
    };
    let body = match payload {
        Ok(Json(body)) => body,
        Err(rejection) => return error_body(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    Json(controller.toggle_shadow(body.enabled)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{OutboundChannel, QueueNotifier};
    use crate::migration::{HealthMetrics, RoutingConfig, TrafficRouter};
    use crate::phone::PhoneNormalizer;
    use crate::pipeline::evaluator::EvaluatorConfig;
    use crate::pipeline::types::{ActionKind, MessageHandler, PipelineResult};
    use crate::store::Database;
    use crate::testing::{FaultyDatabase, MockChannel, RecordingNotifier};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct LegacyStub;

    #[async_trait]
    impl MessageHandler for LegacyStub {
        fn name(&self) -> &str {
            "legacy"
        }

        async fn handle(&self, _message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
            PipelineResult {
                success: true,
                correlation_id,
                elapsed_ms: 1,
                conversation_id: Some("legacy-conv".into()),
                action: Some(ActionKind::ShowMenu),
                target_queue: None,
                ticket_id: None,
                error: None,
                error_kind: None,
            }
        }
    }

    async fn state(with_migration: bool) -> (AppState, Arc<MockChannel>) {
        let db = Arc::new(FaultyDatabase::new().await);
        let channel = Arc::new(MockChannel::new());
        let pipeline = Arc::new(RouterPipeline::new(
            db as Arc<dyn Database>,
            Arc::clone(&channel) as Arc<dyn OutboundChannel>,
            Arc::new(RecordingNotifier::new()) as Arc<dyn QueueNotifier>,
            PhoneNormalizer::default(),
            EvaluatorConfig::default(),
        ));
        let controller = with_migration.then(|| {
            let health = Arc::new(HealthMetrics::new(chrono::Duration::minutes(10)));
            let router = Arc::new(TrafficRouter::new(RoutingConfig::default(), health));
            Arc::new(MigrationController::new(
                Arc::new(LegacyStub),
                Arc::clone(&pipeline) as Arc<dyn MessageHandler>,
                router,
            ))
        });
        (
            AppState {
                pipeline,
                controller,
            },
            channel,
        )
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (state, _) = state(false).await;
        let resp = routes(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["migration"], false);
    }

    #[tokio::test]
    async fn webhook_routes_through_pipeline() {
        let (state, channel) = state(false).await;
        let resp = routes(state)
            .oneshot(post_json(
                "/webhook/messages",
                serde_json::json!({"contact": "+5491111111111", "text": "MENU", "message_id": "wamid.1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["action"], "show_menu");
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (state, channel) = state(false).await;
        let resp = routes(state)
            .oneshot(post_json(
                "/webhook/messages",
                serde_json::json!({"contact": "+5491111111111", "text": "  ", "message_id": "wamid.1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("neither text nor media"));
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let (state, _) = state(false).await;
        let req = Request::builder()
            .method("POST")
            .uri("/webhook/messages")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = routes(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(resp).await["success"], false);
    }

    #[tokio::test]
    async fn invalid_contact_reports_failure_body() {
        let (state, _) = state(false).await;
        let resp = routes(state)
            .oneshot(post_json(
                "/webhook/messages",
                serde_json::json!({"contact": "nobody", "text": "hola", "message_id": "wamid.1"}),
            ))
            .await
            .unwrap();
        let body = json_body(resp).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error_kind"], "invalid_contact");
    }

    #[tokio::test]
    async fn migration_endpoints_need_controller() {
        let (state, _) = state(false).await;
        let resp = routes(state)
            .oneshot(Request::get("/api/migration/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn webhook_goes_through_controller_when_migrating() {
        let (state, channel) = state(true).await;
        let resp = routes(state)
            .oneshot(post_json(
                "/webhook/messages",
                serde_json::json!({"contact": "+5491111111111", "text": "MENU", "message_id": "wamid.1"}),
            ))
            .await
            .unwrap();
        let body = json_body(resp).await;
        // 0% rollout: legacy answers and the new pipeline never runs.
        assert_eq!(body["implementation"], "legacy");
        assert_eq!(body["conversation_id"], "legacy-conv");
        assert_eq!(channel.attempts(), 0);
    }

    #[tokio::test]
    async fn bad_admin_bodies_get_error_json() {
        let (state, _) = state(true).await;
        let app = routes(state);

        for (uri, body) in [
            ("/api/migration/rollout", serde_json::json!({"percentage": 300})),
            ("/api/migration/rollout", serde_json::json!({"percentage": "half"})),
            ("/api/migration/rollout", serde_json::json!({"percentage": 10, "mode": "sideways"})),
            ("/api/migration/shadow", serde_json::json!({"enabled": "yes"})),
            ("/api/migration/shadow", serde_json::json!({})),
        ] {
            let resp = app.clone().oneshot(post_json(uri, body.clone())).await.unwrap();
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{uri} {body}");
            let json = json_body(resp).await;
            assert_eq!(json["success"], false, "{uri} {body}");
            assert!(json["error"].is_string(), "{uri} {body}");
        }

        let resp = app
            .clone()
            .oneshot(post_json("/api/migration/rollout", serde_json::json!({"percentage": 300})))
            .await
            .unwrap();
        let json = json_body(resp).await;
        assert!(json["error"].as_str().unwrap().contains("between 0 and 100"));

        let resp = app
            .oneshot(Request::get("/api/migration/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["config"]["percentage"], 0);
    }

    #[tokio::test]
    async fn rollout_shadow_and_rollback() {
        let (state, _) = state(true).await;
        let app = routes(state);

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/migration/rollout",
                serde_json::json!({"percentage": 30, "mode": "active"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["percentage"], 30);

        let resp = app
            .clone()
            .oneshot(post_json("/api/migration/rollout", serde_json::json!({"percentage": 101})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .clone()
            .oneshot(post_json("/api/migration/shadow", serde_json::json!({"enabled": true})))
            .await
            .unwrap();
        assert_eq!(json_body(resp).await["mode"], "shadow");

        let resp = app
            .clone()
            .oneshot(post_json("/api/migration/rollback", serde_json::json!({"reason": "drill"})))
            .await
            .unwrap();
        let config = json_body(resp).await;
        assert_eq!(config["percentage"], 0);
        assert_eq!(config["mode"], "active");

        let resp = app
            .oneshot(Request::get("/api/migration/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = json_body(resp).await;
        assert_eq!(status["recent_rollbacks"][0]["reason"], "drill");
        assert_eq!(status["recent_rollbacks"][0]["trigger"], "manual");
    }
}
