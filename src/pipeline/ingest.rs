//! Message ingestor: first stage of the pipeline.
//!
//! Normalizes the contact, classifies where the contact came from, makes
//! sure a conversation exists and logs the inbound event. Proxied
//! conversations also get the raw message forwarded to their queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::channels::{NotificationKind, QueueNotification, QueueNotifier};
use crate::error::PipelineError;
use crate::phone::PhoneNormalizer;
use crate::pipeline::evaluator::EvaluatorConfig;
use crate::pipeline::types::{ConversationContext, InboundMessage};
use crate::store::{Database, Direction, InteractionLog};

/// `utm_medium` values that mean paid traffic.
const PAID_MEDIUMS: &[&str] = &["cpc", "ppc", "paid", "ads", "paid_social"];

/// `utm_source` values of ad platforms.
const AD_SOURCES: &[&str] = &[
    "facebook", "fb", "instagram", "ig", "meta", "google", "tiktok",
];

/// Where a contact came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadOrigin {
    /// Arrived from a paid ad.
    pub is_paid: bool,
    /// Origin tag stored on the conversation.
    pub tag: Option<String>,
}

fn lower_str(metadata: &Value, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Classify a contact's origin from message metadata.
///
/// Paid when any of: an ad `utm_medium`, an ad-platform `utm_source`, or a
/// click-to-chat ad referral (`ctwa_clid` / `referral`).
pub fn classify_origin(metadata: &Value) -> LeadOrigin {
    let source = lower_str(metadata, "utm_source");
    let medium = lower_str(metadata, "utm_medium");
    let referral = metadata.get("referral").filter(|v| !v.is_null());
    let ad_click = metadata.get("ctwa_clid").is_some_and(|v| !v.is_null());

    let is_paid = medium.as_deref().is_some_and(|m| PAID_MEDIUMS.contains(&m))
        || source.as_deref().is_some_and(|s| AD_SOURCES.contains(&s))
        || ad_click
        || referral.is_some();

    let tag = source.or_else(|| {
        referral
            .and_then(|r| r.get("source_type"))
            .and_then(Value::as_str)
            .map(|s| format!("referral:{s}"))
            .or_else(|| ad_click.then(|| "ctwa_ad".to_string()))
    });

    LeadOrigin { is_paid, tag }
}

/// Content stored for an inbound message.
fn log_content(message: &InboundMessage) -> String {
    match (&message.media, message.text.is_empty()) {
        (Some(media), true) => format!("[media:{}]", media.kind),
        _ => message.text.clone(),
    }
}

pub struct MessageIngestor {
    db: Arc<dyn Database>,
    notifier: Arc<dyn QueueNotifier>,
    normalizer: PhoneNormalizer,
    config: EvaluatorConfig,
}

impl MessageIngestor {
    pub fn new(
        db: Arc<dyn Database>,
        notifier: Arc<dyn QueueNotifier>,
        normalizer: PhoneNormalizer,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            db,
            notifier,
            normalizer,
            config,
        }
    }

    pub fn normalize(&self, raw: &str) -> Result<String, PipelineError> {
        self.normalizer.normalize(raw)
    }

    /// Normalize, then ingest.
    pub async fn ingest(
        &self,
        message: &InboundMessage,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationContext, PipelineError> {
        let contact = self.normalize(&message.contact)?;
        self.ingest_normalized(&contact, message, correlation_id, now)
            .await
    }

    /// Ingest for an already-normalized contact and return the refreshed
    /// conversation.
    pub async fn ingest_normalized(
        &self,
        contact: &str,
        message: &InboundMessage,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationContext, PipelineError> {
        let fresh = self.fresh_context(contact, message, now);

        self.db
            .upsert_conversation(&fresh)
            .await
            .map_err(|e| PipelineError::IngestFailure(format!("upsert: {e}")))?;

        let ctx = self
            .db
            .get_conversation(contact)
            .await
            .map_err(|e| PipelineError::IngestFailure(format!("fetch: {e}")))?
            .ok_or_else(|| {
                PipelineError::IngestFailure(format!("conversation for {contact} missing after upsert"))
            })?;

        debug!(
            correlation_id = %correlation_id,
            contact,
            conversation_id = %ctx.id,
            is_lead = ctx.is_lead,
            "Conversation ingested"
        );

        let log = InteractionLog::new(&ctx.id, Direction::Inbound, log_content(message), correlation_id)
            .with_channel_message_id(&message.message_id)
            .with_metadata(message.metadata.clone());
        if let Err(e) = self.db.insert_interaction_log(&log).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to write inbound log");
        }

        if ctx.proxy_active {
            self.forward_to_proxy(&ctx, message, correlation_id, now);
        }

        Ok(ctx)
    }

    /// Read-only ingest: the stored conversation as this message would see
    /// it, or the one it would create. Nothing is written or forwarded.
    pub async fn preview(
        &self,
        contact: &str,
        message: &InboundMessage,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ConversationContext, PipelineError> {
        let stored = self
            .db
            .get_conversation(contact)
            .await
            .map_err(|e| PipelineError::IngestFailure(format!("fetch: {e}")))?;

        let ctx = match stored {
            Some(mut ctx) => {
                ctx.last_interaction_at = now;
                ctx
            }
            None => self.fresh_context(contact, message, now),
        };
        debug!(
            correlation_id = %correlation_id,
            contact,
            conversation_id = %ctx.id,
            "Conversation previewed"
        );
        Ok(ctx)
    }

    /// Conversation created on first contact.
    fn fresh_context(&self, contact: &str, message: &InboundMessage, now: DateTime<Utc>) -> ConversationContext {
        let origin = classify_origin(&message.metadata);

        let mut fresh = ConversationContext::new(contact, now, self.config.messaging_window());
        if origin.is_paid {
            fresh.is_lead = true;
            fresh.lead_expires_at = Some(now + self.config.lead_window());
        }
        fresh.origin = origin.tag;
        fresh.metadata = serde_json::json!({ "first_message_id": message.message_id });
        fresh
    }

    fn forward_to_proxy(
        &self,
        ctx: &ConversationContext,
        message: &InboundMessage,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) {
        let Some(area) = ctx.proxy_target else {
            warn!(correlation_id = %correlation_id, contact = %ctx.contact, "Proxy active without a target");
            return;
        };
        let notification = QueueNotification {
            kind: NotificationKind::ProxyForward,
            area,
            contact: ctx.contact.clone(),
            conversation_id: ctx.id.clone(),
            text: log_content(message),
            ticket_id: ctx.ticket_id.clone(),
            correlation_id,
            sent_at: now,
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&notification).await {
                warn!(
                    correlation_id = %notification.correlation_id,
                    area = %notification.area,
                    error = %e,
                    "Proxy forward failed"
                );
            }
        });
    }
}
