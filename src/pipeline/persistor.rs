//! Response persistor: applies the durable side effects of a rendered
//! action and sends the reply.
//!
//! Order of operations:
//! 1. handoff saga (record, ticket, conversation update), or the menu patch
//! 2. outbound log row for non-empty text
//! 3. send through the outbound channel
//! 4. attach the channel message id to the log row

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channels::{NotificationKind, OutboundChannel, QueueNotification, QueueNotifier};
use crate::error::PipelineError;
use crate::pipeline::executor::ERROR_TEXT;
use crate::pipeline::saga::{CreateHandoffRecord, CreateTicket, Saga, UpdateConversation};
use crate::pipeline::types::{
    ActionKind, ConversationContext, ConversationPatch, HandoffRequest, Lifecycle, MenuReset,
    PersistenceInstructions, ROOT_MENU_POSITION, RenderedAction,
};
use crate::store::traits::{HandoffRecord, Ticket};
use crate::store::{Database, Direction, InteractionLog};

/// What the persistor got done.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PersistReport {
    pub sent: bool,
    pub channel_message_id: Option<String>,
    pub ticket_id: Option<String>,
    pub handoff_id: Option<String>,
    pub context_updated: bool,
    pub log_written: bool,
}

/// Hard failure, with whatever was done before it.
#[derive(Debug)]
pub struct PersistFailure {
    pub error: PipelineError,
    pub rollback_attempted: bool,
    pub partial: PersistReport,
}

impl PersistFailure {
    fn new(error: PipelineError, partial: &PersistReport) -> Self {
        Self {
            error,
            rollback_attempted: true,
            partial: partial.clone(),
        }
    }
}

pub struct ResponsePersistor {
    db: Arc<dyn Database>,
    channel: Arc<dyn OutboundChannel>,
    notifier: Arc<dyn QueueNotifier>,
}

impl ResponsePersistor {
    pub fn new(
        db: Arc<dyn Database>,
        channel: Arc<dyn OutboundChannel>,
        notifier: Arc<dyn QueueNotifier>,
    ) -> Self {
        Self {
            db,
            channel,
            notifier,
        }
    }

    pub async fn persist(
        &self,
        ctx: &ConversationContext,
        rendered: &RenderedAction,
        inbound_text: &str,
        correlation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PersistReport, PersistFailure> {
        let mut report = PersistReport::default();
        if !rendered.requires_persistence {
            return Ok(report);
        }
        let instructions = &rendered.persistence;

        if let Some(ref request) = instructions.handoff {
            self.handoff(ctx, request, instructions, inbound_text, correlation_id, now, &mut report)
                .await?;
        } else {
            let patch = menu_patch(ctx, instructions);
            if !patch.is_empty() {
                self.db
                    .update_conversation(&ctx.contact, &patch)
                    .await
                    .map_err(|e| PersistFailure::new(e.into(), &report))?;
                report.context_updated = true;
            }
        }

        if rendered.text.is_empty() {
            return Ok(report);
        }

        let log = InteractionLog::new(&ctx.id, Direction::Outbound, &rendered.text, correlation_id)
            .with_metadata(serde_json::json!({
                "action": rendered.action.label(),
                "details": rendered.metadata,
            }));
        self.db
            .insert_interaction_log(&log)
            .await
            .map_err(|e| PersistFailure::new(e.into(), &report))?;
        report.log_written = true;

        let receipt = match self.channel.send(&ctx.contact, &rendered.text).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(
                    correlation_id = %correlation_id,
                    contact = %ctx.contact,
                    channel = self.channel.name(),
                    error = %e,
                    "Outbound send failed"
                );
                if rendered.action != ActionKind::Error {
                    self.send_recovery(&ctx.contact, correlation_id).await;
                }
                return Err(PersistFailure::new(
                    PipelineError::SendFailure(e.to_string()),
                    &report,
                ));
            }
        };
        report.sent = true;

        if let Some(ref channel_id) = receipt.channel_message_id {
            if let Err(e) = self.db.set_log_channel_message_id(&log.id, channel_id).await {
                warn!(correlation_id = %correlation_id, error = %e, "Failed to attach channel id to outbound log");
            }
        }
        report.channel_message_id = receipt.channel_message_id;

        debug!(
            correlation_id = %correlation_id,
            action = rendered.action.label(),
            context_updated = report.context_updated,
            "Response persisted"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handoff(
        &self,
        ctx: &ConversationContext,
        request: &HandoffRequest,
        instructions: &PersistenceInstructions,
        inbound_text: &str,
        correlation_id: Uuid,
        now: DateTime<Utc>,
        report: &mut PersistReport,
    ) -> Result<(), PersistFailure> {
        let record = HandoffRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: ctx.id.clone(),
            origin: request.origin,
            destination: request.destination,
            reason: request.reason.as_str().to_string(),
            correlation_id,
            created_at: now,
        };
        let ticket = request.create_ticket.then(|| Ticket::for_handoff(&record));
        let patch = handoff_patch(ctx, request, instructions, ticket.as_ref(), now);

        let mut saga = Saga::new(self.db.as_ref(), correlation_id).step(CreateHandoffRecord(&record));
        if let Some(ref ticket) = ticket {
            saga = saga.step(CreateTicket(ticket));
        }
        saga.step(UpdateConversation {
            contact: &ctx.contact,
            revert: patch.revert_against(ctx),
            patch,
        })
        .run()
        .await
        .map_err(|e| PersistFailure::new(e, report))?;

        report.handoff_id = Some(record.id.clone());
        report.ticket_id = ticket.as_ref().map(|t| t.id.clone());
        report.context_updated = true;

        info!(
            correlation_id = %correlation_id,
            contact = %ctx.contact,
            origin = %request.origin,
            destination = %request.destination,
            ticket_id = report.ticket_id.as_deref().unwrap_or(""),
            "Conversation handed off"
        );

        let audit = InteractionLog::new(
            &ctx.id,
            Direction::Handoff,
            format!("{} -> {}", request.origin, request.destination),
            correlation_id,
        )
        .with_metadata(serde_json::json!({
            "handoff_id": record.id,
            "ticket_id": report.ticket_id,
            "reason": request.reason.as_str(),
            "sub_label": request.sub_label,
        }));
        if let Err(e) = self.db.insert_interaction_log(&audit).await {
            warn!(correlation_id = %correlation_id, error = %e, "Failed to write handoff log");
        }

        let notification = QueueNotification {
            kind: NotificationKind::Handoff,
            area: request.destination,
            contact: ctx.contact.clone(),
            conversation_id: ctx.id.clone(),
            text: inbound_text.to_string(),
            ticket_id: report.ticket_id.clone(),
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
                    "Handoff notification failed"
                );
            }
        });
        Ok(())
    }

    async fn send_recovery(&self, contact: &str, correlation_id: Uuid) {
        if let Err(e) = self.channel.send(contact, ERROR_TEXT).await {
            warn!(correlation_id = %correlation_id, error = %e, "Recovery message failed");
        }
    }
}

/// Conversation changes for a handoff.
fn handoff_patch(
    ctx: &ConversationContext,
    request: &HandoffRequest,
    instructions: &PersistenceInstructions,
    ticket: Option<&Ticket>,
    now: DateTime<Utc>,
) -> ConversationPatch {
    let mut patch = ConversationPatch {
        area: Some(request.destination),
        sub_label: Some(request.sub_label.clone()),
        lifecycle: Some(Lifecycle::HandedOff),
        last_handoff_at: Some(Some(now)),
        handoff_count: Some(ctx.handoff_count.saturating_add(1)),
        proxy_active: Some(true),
        proxy_target: Some(Some(request.destination)),
        ..menu_patch(ctx, instructions)
    };
    if let Some(ticket) = ticket {
        patch.ticket_id = Some(Some(ticket.id.clone()));
    }
    patch
}

/// Menu position, proxy and counter changes.
fn menu_patch(ctx: &ConversationContext, instructions: &PersistenceInstructions) -> ConversationPatch {
    let mut patch = ConversationPatch::default();
    match instructions.menu_reset {
        Some(MenuReset::Root) => patch.menu_position = Some(Some(ROOT_MENU_POSITION.to_string())),
        Some(MenuReset::Cleared) => patch.menu_position = Some(None),
        None => {}
    }
    if instructions.deactivate_proxy {
        patch.proxy_active = Some(false);
        patch.proxy_target = Some(None);
    }
    if let Some(option) = instructions.last_option {
        patch.last_option = Some(Some(option));
    }
    if instructions.count_automatic {
        patch.automatic_messages = Some(ctx.automatic_messages.saturating_add(1));
    }
    patch
}
