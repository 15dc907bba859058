//! Router pipeline: runs the four stages for one inbound message.
//!
//! Flow:
//! 1. Ingest: normalize contact, upsert conversation, log inbound
//! 2. Evaluate: pure decision from context and text
//! 3. Execute: render reply text and persistence instructions
//! 4. Persist: handoff saga / menu patch, outbound log, send
//!
//! Runs for the same contact are serialized; different contacts run
//! concurrently. Any stage error aborts the remaining stages.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{OutboundChannel, QueueNotifier};
use crate::error::PipelineError;
use crate::locks::ContactLocks;
use crate::phone::PhoneNormalizer;
use crate::pipeline::evaluator::{EvaluatorConfig, StateEvaluator};
use crate::pipeline::executor::ActionExecutor;
use crate::pipeline::ingest::MessageIngestor;
use crate::pipeline::persistor::ResponsePersistor;
use crate::pipeline::types::{
    ActionKind, ConversationContext, InboundMessage, MessageHandler, PipelineResult, RenderedAction,
};
use crate::store::Database;

const HANDLER_NAME: &str = "new";

pub struct RouterPipeline {
    ingestor: MessageIngestor,
    evaluator: StateEvaluator,
    executor: ActionExecutor,
    persistor: ResponsePersistor,
    locks: ContactLocks,
}

impl RouterPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn OutboundChannel>,
        notifier: Arc<dyn QueueNotifier>,
        normalizer: PhoneNormalizer,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            ingestor: MessageIngestor::new(Arc::clone(&db), Arc::clone(&notifier), normalizer, config),
            evaluator: StateEvaluator::new(config),
            executor: ActionExecutor::new(),
            persistor: ResponsePersistor::new(db, channel, notifier),
            locks: ContactLocks::new(),
        }
    }

    /// Route one message end to end. Never fails: errors are reported in
    /// the result.
    pub async fn process(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let contact = match self.ingestor.normalize(&message.contact) {
            Ok(contact) => contact,
            Err(e) => return failed(correlation_id, elapsed(), &e),
        };

        let _guard = self.locks.lock(&contact).await;
        let now = Utc::now();

        // Stage 1: ingest
        let ctx = match self
            .ingestor
            .ingest_normalized(&contact, message, correlation_id, now)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return failed(correlation_id, elapsed(), &e),
        };

        let (rendered, mut result) = self.decide(&ctx, message, correlation_id, now);

        // Stage 4: persist
        match self
            .persistor
            .persist(&ctx, &rendered, &message.text, correlation_id, now)
            .await
        {
            Ok(report) => {
                result.ticket_id = report.ticket_id;
                result.elapsed_ms = elapsed();
                info!(
                    correlation_id = %correlation_id,
                    contact = %contact,
                    action = rendered.action.label(),
                    target = result.target_queue.as_deref().unwrap_or(""),
                    sent = report.sent,
                    elapsed_ms = result.elapsed_ms,
                    "Message routed"
                );
            }
            Err(failure) => {
                result.success = false;
                result.ticket_id = failure.partial.ticket_id;
                result.error = Some(failure.error.to_string());
                result.error_kind = Some(failure.error.kind().to_string());
                result.elapsed_ms = elapsed();
                warn!(
                    correlation_id = %correlation_id,
                    contact = %contact,
                    action = rendered.action.label(),
                    error = %failure.error,
                    rollback_attempted = failure.rollback_attempted,
                    elapsed_ms = result.elapsed_ms,
                    "Persistence failed"
                );
            }
        }
        result
    }

    /// Dry run for shadow comparison: same decision as [`Self::process`],
    /// but the conversation is only read and nothing is persisted, sent or
    /// forwarded. `ticket_id` stays empty since no ticket is opened.
    pub async fn preview(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        let started = Instant::now();
        let elapsed = || started.elapsed().as_millis() as u64;

        let contact = match self.ingestor.normalize(&message.contact) {
            Ok(contact) => contact,
            Err(e) => return failed(correlation_id, elapsed(), &e),
        };

        let _guard = self.locks.lock(&contact).await;
        let now = Utc::now();

        let ctx = match self
            .ingestor
            .preview(&contact, message, correlation_id, now)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => return failed(correlation_id, elapsed(), &e),
        };

        let (rendered, mut result) = self.decide(&ctx, message, correlation_id, now);
        result.elapsed_ms = elapsed();
        debug!(
            correlation_id = %correlation_id,
            contact = %contact,
            action = rendered.action.label(),
            target = result.target_queue.as_deref().unwrap_or(""),
            elapsed_ms = result.elapsed_ms,
            "Shadow run decided"
        );
        result
    }

    /// Evaluate and execute against an ingested conversation.
    fn decide(
        &self,
        ctx: &ConversationContext,
        message: &InboundMessage,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> (RenderedAction, PipelineResult) {
        // Stage 2: evaluate
        let decision = self.evaluator.evaluate(ctx, &message.text, now);
        debug!(
            correlation_id = %correlation_id,
            action = decision.action.label(),
            reason = decision.reason.as_str(),
            antiloop_active = decision.antiloop_active,
            timeout_active = decision.timeout_active,
            "Decision taken"
        );

        // Stage 3: execute
        let rendered = self.executor.execute(&decision, ctx);

        let mut result = PipelineResult {
            success: true,
            correlation_id,
            elapsed_ms: 0,
            conversation_id: Some(ctx.id.clone()),
            action: Some(rendered.action),
            target_queue: decision.target.map(|area| area.as_str().to_string()),
            ticket_id: None,
            error: None,
            error_kind: None,
        };
        if rendered.action == ActionKind::Error {
            result.error = decision
                .metadata
                .get("error")
                .and_then(|v| v.as_str())
                .map(String::from);
        }
        (rendered, result)
    }
}

fn failed(correlation_id: Uuid, elapsed_ms: u64, error: &PipelineError) -> PipelineResult {
    warn!(
        correlation_id = %correlation_id,
        error = %error,
        error_kind = error.kind(),
        elapsed_ms,
        "Pipeline aborted"
    );
    PipelineResult {
        error_kind: Some(error.kind().to_string()),
        ..PipelineResult::failure(correlation_id, elapsed_ms, error.to_string())
    }
}

#[async_trait]
impl MessageHandler for RouterPipeline {
    fn name(&self) -> &str {
        HANDLER_NAME
    }

    async fn handle(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        self.process(message, correlation_id).await
    }

    async fn handle_shadow(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        self.preview(message, correlation_id).await
    }
}
