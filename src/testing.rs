//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{OutboundChannel, QueueNotification, QueueNotifier, SendReceipt};
use crate::error::{ChannelError, DatabaseError};
use crate::migration::Implementation;
use crate::migration::comparator::ComparisonResult;
use crate::migration::health::CallSample;
use crate::pipeline::types::{ConversationContext, ConversationPatch};
use crate::store::traits::{HandoffRecord, InteractionLog, Ticket};
use crate::store::{Database, Direction, LibSqlBackend};

// ── Channel ─────────────────────────────────────────────────────────

/// Records sent messages; can be switched into a failing mode.
#[derive(Default)]
pub struct MockChannel {
    sent: Mutex<Vec<(String, String)>>,
    attempts: AtomicUsize,
    failing: AtomicBool,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let channel = Self::default();
        channel.set_failing(true);
        channel
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Successfully sent `(contact, text)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundChannel for MockChannel {
    fn name(&self) -> &str {
        "mock"
    }

    async fn send(&self, contact: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelError::SendFailed {
                name: "mock".into(),
                reason: "forced failure".into(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((contact.to_string(), text.to_string()));
        Ok(SendReceipt {
            channel_message_id: Some(format!("wamid.out{n}")),
        })
    }
}

// ── Notifier ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<QueueNotification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<QueueNotification> {
        self.seen.lock().unwrap().clone()
    }

    /// Notifications are sent from spawned tasks; poll until `count` arrive.
    pub async fn wait_for(&self, count: usize) -> Vec<QueueNotification> {
        for _ in 0..100 {
            let seen = self.notifications();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notifications()
    }
}

#[async_trait]
impl QueueNotifier for RecordingNotifier {
    async fn notify(&self, notification: &QueueNotification) -> Result<(), ChannelError> {
        self.seen.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

// ── Database ────────────────────────────────────────────────────────

/// Operations [`FaultyDatabase`] can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    UpsertConversation,
    GetConversation,
    UpdateConversation,
    InsertHandoff,
    DeleteHandoff,
    InsertTicket,
    DeleteTicket,
    InboundLog,
    OutboundLog,
    SetLogChannelMessageId,
}

/// In-memory libSQL store with per-operation fault injection.
pub struct FaultyDatabase {
    inner: LibSqlBackend,
    faults: Mutex<HashSet<Fault>>,
}

impl FaultyDatabase {
    pub async fn new() -> Self {
        let inner = LibSqlBackend::new_memory().await.unwrap();
        inner.init_schema().await.unwrap();
        Self {
            inner,
            faults: Mutex::default(),
        }
    }

    pub fn fail(&self, fault: Fault) {
        self.faults.lock().unwrap().insert(fault);
    }

    pub fn heal(&self, fault: Fault) {
        self.faults.lock().unwrap().remove(&fault);
    }

    fn check(&self, fault: Fault) -> Result<(), DatabaseError> {
        if self.faults.lock().unwrap().contains(&fault) {
            return Err(DatabaseError::Query(format!("injected fault: {fault:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Database for FaultyDatabase {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        self.inner.init_schema().await
    }

    async fn upsert_conversation(&self, ctx: &ConversationContext) -> Result<(), DatabaseError> {
        self.check(Fault::UpsertConversation)?;
        self.inner.upsert_conversation(ctx).await
    }

    async fn get_conversation(
        &self,
        contact: &str,
    ) -> Result<Option<ConversationContext>, DatabaseError> {
        self.check(Fault::GetConversation)?;
        self.inner.get_conversation(contact).await
    }

    async fn update_conversation(
        &self,
        contact: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError> {
        self.check(Fault::UpdateConversation)?;
        self.inner.update_conversation(contact, patch).await
    }

    async fn insert_handoff(&self, record: &HandoffRecord) -> Result<(), DatabaseError> {
        self.check(Fault::InsertHandoff)?;
        self.inner.insert_handoff(record).await
    }

    async fn delete_handoff(&self, id: &str) -> Result<bool, DatabaseError> {
        self.check(Fault::DeleteHandoff)?;
        self.inner.delete_handoff(id).await
    }

    async fn list_handoffs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<HandoffRecord>, DatabaseError> {
        self.inner.list_handoffs(conversation_id).await
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        self.check(Fault::InsertTicket)?;
        self.inner.insert_ticket(ticket).await
    }

    async fn delete_ticket(&self, id: &str) -> Result<bool, DatabaseError> {
        self.check(Fault::DeleteTicket)?;
        self.inner.delete_ticket(id).await
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>, DatabaseError> {
        self.inner.get_ticket(id).await
    }

    async fn insert_interaction_log(&self, log: &InteractionLog) -> Result<(), DatabaseError> {
        match log.direction {
            Direction::Inbound => self.check(Fault::InboundLog)?,
            Direction::Outbound => self.check(Fault::OutboundLog)?,
            Direction::Handoff => {}
        }
        self.inner.insert_interaction_log(log).await
    }

    async fn latest_outbound_log(
        &self,
        conversation_id: &str,
    ) -> Result<Option<InteractionLog>, DatabaseError> {
        self.inner.latest_outbound_log(conversation_id).await
    }

    async fn set_log_channel_message_id(
        &self,
        log_id: &str,
        channel_message_id: &str,
    ) -> Result<(), DatabaseError> {
        self.check(Fault::SetLogChannelMessageId)?;
        self.inner
            .set_log_channel_message_id(log_id, channel_message_id)
            .await
    }

    async fn list_interaction_logs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<InteractionLog>, DatabaseError> {
        self.inner.list_interaction_logs(conversation_id).await
    }

    async fn record_health_sample(
        &self,
        implementation: Implementation,
        sample: &CallSample,
    ) -> Result<(), DatabaseError> {
        self.inner.record_health_sample(implementation, sample).await
    }

    async fn record_comparison(&self, result: &ComparisonResult) -> Result<(), DatabaseError> {
        self.inner.record_comparison(result).await
    }

    async fn recent_comparisons(
        &self,
        limit: usize,
    ) -> Result<Vec<ComparisonResult>, DatabaseError> {
        self.inner.recent_comparisons(limit).await
    }
}
