//! Outbound messaging and queue notification capabilities.

pub mod notify;
pub mod whatsapp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelError;
use crate::pipeline::area::Area;

pub use notify::WebhookNotifier;
pub use whatsapp::WhatsAppChannel;

/// Acknowledgement of an outbound send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendReceipt {
    /// Id the channel assigned to the sent message, when it reports one.
    pub channel_message_id: Option<String>,
}

/// Messaging channel used to reply to contacts.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Channel name for logs.
    fn name(&self) -> &str;

    /// Send a text message to a normalized contact.
    async fn send(&self, contact: &str, text: &str) -> Result<SendReceipt, ChannelError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A conversation was handed off to the queue.
    Handoff,
    /// A message arrived for a conversation the queue is proxying.
    ProxyForward,
}

/// Event pushed to a human queue's external sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueNotification {
    pub kind: NotificationKind,
    pub area: Area,
    pub contact: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub correlation_id: Uuid,
    pub sent_at: DateTime<Utc>,
}

/// Fire-and-forget sink notified on handoffs and proxied messages.
#[async_trait]
pub trait QueueNotifier: Send + Sync {
    async fn notify(&self, notification: &QueueNotification) -> Result<(), ChannelError>;
}
