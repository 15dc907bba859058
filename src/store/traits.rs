//! Unified `Database` trait: single async interface for all persistence.
//!
//! The store is accessed one statement at a time; there are no
//! multi-statement transactions behind this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::migration::comparator::ComparisonResult;
use crate::migration::health::CallSample;
use crate::migration::Implementation;
use crate::pipeline::area::Area;
use crate::pipeline::types::{ConversationContext, ConversationPatch};

/// A handoff from one queue to another. Paired 1:1 with a [`Ticket`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRecord {
    pub id: String,
    pub conversation_id: String,
    pub origin: Area,
    pub destination: Area,
    pub reason: String,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Status of a human-queue ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Pending,
    InProgress,
    Resolved,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "in_progress" => Self::InProgress,
            "resolved" => Self::Resolved,
            _ => Self::Pending,
        }
    }
}

/// Ticket priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Normal,
    High,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "low" => Self::Low,
            "high" => Self::High,
            _ => Self::Normal,
        }
    }
}

/// Human-queue work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    /// Human-readable id, e.g. `TK-20260114-4F2A9C`.
    pub id: String,
    pub handoff_id: String,
    pub conversation_id: String,
    pub destination: Area,
    pub status: TicketStatus,
    pub priority: TicketPriority,
    pub created_at: DateTime<Utc>,
}

impl Ticket {
    /// New pending ticket for a handoff.
    pub fn for_handoff(handoff: &HandoffRecord) -> Self {
        let suffix: String = Uuid::new_v4()
            .simple()
            .to_string()
            .chars()
            .take(6)
            .collect::<String>()
            .to_uppercase();
        Self {
            id: format!("TK-{}-{}", handoff.created_at.format("%Y%m%d"), suffix),
            handoff_id: handoff.id.clone(),
            conversation_id: handoff.conversation_id.clone(),
            destination: handoff.destination,
            status: TicketStatus::Pending,
            priority: TicketPriority::Normal,
            created_at: handoff.created_at,
        }
    }
}

/// Direction of an interaction log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
    Handoff,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
            Self::Handoff => "handoff",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "outbound" => Self::Outbound,
            "handoff" => Self::Handoff,
            _ => Self::Inbound,
        }
    }
}

/// Append-only audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionLog {
    pub id: String,
    pub conversation_id: String,
    pub direction: Direction,
    pub content: String,
    /// Channel-assigned message id (inbound id, or outbound id once sent).
    pub channel_message_id: Option<String>,
    pub correlation_id: Uuid,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl InteractionLog {
    pub fn new(
        conversation_id: impl Into<String>,
        direction: Direction,
        content: impl Into<String>,
        correlation_id: Uuid,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            direction,
            content: content.into(),
            channel_message_id: None,
            correlation_id,
            metadata: serde_json::json!({}),
            created_at: Utc::now(),
        }
    }

    pub fn with_channel_message_id(mut self, id: impl Into<String>) -> Self {
        self.channel_message_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Backend-agnostic database trait covering the routing schema.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create tables / run pending migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Conversations ───────────────────────────────────────────────

    /// Insert the conversation if the contact is new; otherwise only refresh
    /// `last_interaction_at`. Existing area/state are never reset.
    async fn upsert_conversation(&self, ctx: &ConversationContext) -> Result<(), DatabaseError>;

    /// Fetch a conversation by normalized contact.
    async fn get_conversation(
        &self,
        contact: &str,
    ) -> Result<Option<ConversationContext>, DatabaseError>;

    /// Apply a partial update. Fails with `NotFound` for unknown contacts.
    async fn update_conversation(
        &self,
        contact: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError>;

    // ── Handoffs & tickets ──────────────────────────────────────────

    async fn insert_handoff(&self, record: &HandoffRecord) -> Result<(), DatabaseError>;

    /// Delete a handoff. Returns whether a row was removed.
    async fn delete_handoff(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Audit read: handoffs for a conversation, oldest first.
    async fn list_handoffs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<HandoffRecord>, DatabaseError>;

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError>;

    /// Delete a ticket. Returns whether a row was removed.
    async fn delete_ticket(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Audit read for operator tooling.
    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>, DatabaseError>;

    // ── Interaction logs ────────────────────────────────────────────

    async fn insert_interaction_log(&self, log: &InteractionLog) -> Result<(), DatabaseError>;

    /// Most recent outbound row for a conversation. Audit read: the
    /// persistor patches channel ids by the log id it wrote instead.
    async fn latest_outbound_log(
        &self,
        conversation_id: &str,
    ) -> Result<Option<InteractionLog>, DatabaseError>;

    /// Attach the channel-assigned id to a logged outbound message.
    async fn set_log_channel_message_id(
        &self,
        log_id: &str,
        channel_message_id: &str,
    ) -> Result<(), DatabaseError>;

    /// Audit read: all rows for a conversation, oldest first.
    async fn list_interaction_logs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<InteractionLog>, DatabaseError>;

    // ── Migration telemetry ─────────────────────────────────────────

    async fn record_health_sample(
        &self,
        implementation: Implementation,
        sample: &CallSample,
    ) -> Result<(), DatabaseError>;

    async fn record_comparison(&self, result: &ComparisonResult) -> Result<(), DatabaseError>;

    /// Most recent comparisons, newest first.
    async fn recent_comparisons(&self, limit: usize)
    -> Result<Vec<ComparisonResult>, DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticket_id_is_human_readable() {
        let handoff = HandoffRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: "conv-1".into(),
            origin: Area::General,
            destination: Area::Admin,
            reason: "menu_selection".into(),
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        let ticket = Ticket::for_handoff(&handoff);
        assert!(ticket.id.starts_with("TK-"));
        assert_eq!(ticket.id.len(), "TK-20260101-ABCDEF".len());
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.priority, TicketPriority::Normal);
        assert_eq!(ticket.destination, Area::Admin);
        assert_eq!(ticket.handoff_id, handoff.id);
    }

    #[test]
    fn enum_storage_roundtrips() {
        for d in [Direction::Inbound, Direction::Outbound, Direction::Handoff] {
            assert_eq!(Direction::from_db(d.as_str()), d);
        }
        for s in [
            TicketStatus::Pending,
            TicketStatus::InProgress,
            TicketStatus::Resolved,
        ] {
            assert_eq!(TicketStatus::from_db(s.as_str()), s);
        }
        for p in [TicketPriority::Low, TicketPriority::Normal, TicketPriority::High] {
            assert_eq!(TicketPriority::from_db(p.as_str()), p);
        }
    }
}
