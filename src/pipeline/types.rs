//! Shared types for the message routing pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::pipeline::area::Area;

/// Menu position stored when the contact is looking at the root menu.
pub const ROOT_MENU_POSITION: &str = "root";

// ── Inbound message ─────────────────────────────────────────────────

/// Inbound chat message as delivered by the channel webhook.
///
/// Immutable once received; every stage borrows it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Raw contact identifier (phone number in whatever format the channel uses).
    pub contact: String,
    /// Message body. May be empty for media-only messages.
    #[serde(default)]
    pub text: String,
    /// Channel-assigned message id.
    pub message_id: String,
    /// When the channel received the message.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    /// Optional multimedia attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaDescriptor>,
    /// Free-form metadata: UTM/source tags, correlation id, referral info.
    #[serde(default = "empty_object")]
    pub metadata: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

impl InboundMessage {
    /// Build a plain text message (used by tests and the legacy adapter).
    pub fn text(contact: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            contact: contact.into(),
            text: text.into(),
            message_id: format!("wamid.{}", Uuid::new_v4().simple()),
            received_at: Utc::now(),
            media: None,
            metadata: empty_object(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// String value of a metadata key, if present.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Correlation id carried in metadata, if it is a valid UUID.
    pub fn correlation_id(&self) -> Option<Uuid> {
        self.metadata_str("correlation_id")
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// Attachment descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaDescriptor {
    /// "image", "audio", "document", "video", "sticker".
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

// ── Conversation state ──────────────────────────────────────────────

/// Lifecycle of a conversation. Conversations are never deleted; they close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Active,
    HandedOff,
    Closed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::HandedOff => "handed_off",
            Self::Closed => "closed",
        }
    }

    /// Parse a stored value; unknown values read as `Active`.
    pub fn from_db(s: &str) -> Self {
        match s {
            "handed_off" => Self::HandedOff,
            "closed" => Self::Closed,
            _ => Self::Active,
        }
    }
}

/// Per-contact conversation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Conversation id (UUID string).
    pub id: String,
    /// Normalized contact identifier, unique per conversation.
    pub contact: String,
    /// Queue currently owning the conversation.
    pub area: Area,
    /// Sub-label chosen inside the area (e.g. "administracion").
    pub sub_label: Option<String>,
    pub lifecycle: Lifecycle,
    /// Current menu position (`"root"` when the root menu was shown last).
    pub menu_position: Option<String>,
    /// Last root-menu option the contact picked.
    pub last_option: Option<u8>,
    /// End of the 24h messaging window opened on first contact.
    pub window_expires_at: DateTime<Utc>,
    /// Contact arrived from a paid ad.
    pub is_lead: bool,
    /// End of the 72h lead window, only for paid leads.
    pub lead_expires_at: Option<DateTime<Utc>>,
    pub last_handoff_at: Option<DateTime<Utc>>,
    pub handoff_count: u32,
    /// Sticky pin: the conversation stays in `area` instead of the default queue.
    pub disconnected_from_default: bool,
    /// Auto-redirect every message to `proxy_target` without menus.
    pub proxy_active: bool,
    pub proxy_target: Option<Area>,
    /// Number of automatic replies sent.
    pub automatic_messages: u32,
    /// Origin tag (utm_source or channel referral).
    pub origin: Option<String>,
    /// Human-readable id of the open ticket.
    pub ticket_id: Option<String>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_interaction_at: DateTime<Utc>,
}

impl ConversationContext {
    /// Fresh context for a first-time contact.
    pub fn new(contact: impl Into<String>, now: DateTime<Utc>, window: chrono::Duration) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            contact: contact.into(),
            area: Area::DEFAULT,
            sub_label: None,
            lifecycle: Lifecycle::Active,
            menu_position: None,
            last_option: None,
            window_expires_at: now + window,
            is_lead: false,
            lead_expires_at: None,
            last_handoff_at: None,
            handoff_count: 0,
            disconnected_from_default: false,
            proxy_active: false,
            proxy_target: None,
            automatic_messages: 0,
            origin: None,
            ticket_id: None,
            metadata: empty_object(),
            created_at: now,
            last_interaction_at: now,
        }
    }
}

/// Partial update of a conversation. `None` leaves a column untouched;
/// nested `Option`s distinguish "set to NULL" from "leave alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
    pub area: Option<Area>,
    pub sub_label: Option<Option<String>>,
    pub lifecycle: Option<Lifecycle>,
    pub menu_position: Option<Option<String>>,
    pub last_option: Option<Option<u8>>,
    pub last_handoff_at: Option<Option<DateTime<Utc>>>,
    pub handoff_count: Option<u32>,
    pub ticket_id: Option<Option<String>>,
    pub proxy_active: Option<bool>,
    pub proxy_target: Option<Option<Area>>,
    pub automatic_messages: Option<u32>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Apply the patch in place.
    pub fn apply(&self, ctx: &mut ConversationContext) {
        if let Some(area) = self.area {
            ctx.area = area;
        }
        if let Some(ref sub_label) = self.sub_label {
            ctx.sub_label = sub_label.clone();
        }
        if let Some(lifecycle) = self.lifecycle {
            ctx.lifecycle = lifecycle;
        }
        if let Some(ref position) = self.menu_position {
            ctx.menu_position = position.clone();
        }
        if let Some(option) = self.last_option {
            ctx.last_option = option;
        }
        if let Some(at) = self.last_handoff_at {
            ctx.last_handoff_at = at;
        }
        if let Some(count) = self.handoff_count {
            ctx.handoff_count = count;
        }
        if let Some(ref ticket) = self.ticket_id {
            ctx.ticket_id = ticket.clone();
        }
        if let Some(active) = self.proxy_active {
            ctx.proxy_active = active;
        }
        if let Some(target) = self.proxy_target {
            ctx.proxy_target = target;
        }
        if let Some(count) = self.automatic_messages {
            ctx.automatic_messages = count;
        }
    }

    /// Patch restoring every field this patch touches to its value in `ctx`.
    pub fn revert_against(&self, ctx: &ConversationContext) -> Self {
        Self {
            area: self.area.map(|_| ctx.area),
            sub_label: self.sub_label.as_ref().map(|_| ctx.sub_label.clone()),
            lifecycle: self.lifecycle.map(|_| ctx.lifecycle),
            menu_position: self.menu_position.as_ref().map(|_| ctx.menu_position.clone()),
            last_option: self.last_option.map(|_| ctx.last_option),
            last_handoff_at: self.last_handoff_at.map(|_| ctx.last_handoff_at),
            handoff_count: self.handoff_count.map(|_| ctx.handoff_count),
            ticket_id: self.ticket_id.as_ref().map(|_| ctx.ticket_id.clone()),
            proxy_active: self.proxy_active.map(|_| ctx.proxy_active),
            proxy_target: self.proxy_target.map(|_| ctx.proxy_target),
            automatic_messages: self.automatic_messages.map(|_| ctx.automatic_messages),
        }
    }
}

// ── Decision ────────────────────────────────────────────────────────

/// What the router decided to do with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ShowMenu,
    HandOff,
    ContinueHuman,
    Courtesy,
    Timeout,
    Error,
}

impl ActionKind {
    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::ShowMenu => "show_menu",
            Self::HandOff => "hand_off",
            Self::ContinueHuman => "continue_human",
            Self::Courtesy => "courtesy",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

/// Why a decision was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ProxyAutoRedirect,
    ProxyMenuCommand,
    PinnedConversation,
    MenuCommand,
    AntiloopCourtesy,
    MenuSelection,
    AlreadyInArea,
    DefaultArea,
    HumanConversation,
    SystemError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProxyAutoRedirect => "proxy_auto_redirect",
            Self::ProxyMenuCommand => "proxy_menu_command",
            Self::PinnedConversation => "pinned_conversation",
            Self::MenuCommand => "menu_command",
            Self::AntiloopCourtesy => "antiloop_courtesy",
            Self::MenuSelection => "menu_selection",
            Self::AlreadyInArea => "already_in_area",
            Self::DefaultArea => "default_area",
            Self::HumanConversation => "human_conversation",
            Self::SystemError => "system_error",
        }
    }
}

/// Output of the state evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: ActionKind,
    pub target: Option<Area>,
    pub sub_label: Option<String>,
    /// Root-menu option that produced this decision, if any.
    pub selected_option: Option<u8>,
    pub requires_handoff: bool,
    /// An automatic (bot-authored) reply will be sent.
    pub is_automatic: bool,
    pub antiloop_active: bool,
    pub timeout_active: bool,
    /// Leaving proxy mode because the contact asked for the menu.
    pub deactivate_proxy: bool,
    pub reason: ReasonCode,
    pub metadata: serde_json::Value,
}

impl Decision {
    /// Decision skeleton with every flag cleared.
    pub fn new(action: ActionKind, reason: ReasonCode) -> Self {
        Self {
            action,
            target: None,
            sub_label: None,
            selected_option: None,
            requires_handoff: action == ActionKind::HandOff,
            is_automatic: !matches!(action, ActionKind::ContinueHuman),
            antiloop_active: false,
            timeout_active: false,
            deactivate_proxy: false,
            reason,
            metadata: empty_object(),
        }
    }

    pub fn with_target(mut self, area: Area, sub_label: Option<&str>) -> Self {
        self.target = Some(area);
        self.sub_label = sub_label.map(String::from);
        self
    }
}

// ── Rendered action ─────────────────────────────────────────────────

/// How the menu position changes after this action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuReset {
    /// Contact is now looking at the root menu.
    Root,
    /// Menu position cleared (conversation left the menu).
    Cleared,
}

/// Handoff requested by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffRequest {
    pub origin: Area,
    pub destination: Area,
    pub sub_label: Option<String>,
    pub reason: ReasonCode,
    pub create_ticket: bool,
}

/// Durable side effects the persistor must apply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistenceInstructions {
    pub menu_reset: Option<MenuReset>,
    pub deactivate_proxy: bool,
    pub handoff: Option<HandoffRequest>,
    /// Root-menu option to remember on the conversation.
    pub last_option: Option<u8>,
    /// Bump the automatic-message counter.
    pub count_automatic: bool,
}

/// Output of the action executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedAction {
    pub action: ActionKind,
    /// Outbound text; empty means nothing is sent.
    pub text: String,
    pub requires_persistence: bool,
    pub persistence: PersistenceInstructions,
    pub metadata: serde_json::Value,
}

// ── Pipeline result ─────────────────────────────────────────────────

/// Unified result of one routing run, also the HTTP response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub correlation_id: Uuid,
    pub elapsed_ms: u64,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub action: Option<ActionKind>,
    /// Target queue key; kept as a string so other implementations can report
    /// queues this build does not know about.
    #[serde(default)]
    pub target_queue: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl PipelineResult {
    /// Failed result with no stage output.
    pub fn failure(correlation_id: Uuid, elapsed_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            correlation_id,
            elapsed_ms,
            conversation_id: None,
            action: None,
            target_queue: None,
            ticket_id: None,
            error: Some(error.into()),
            error_kind: None,
        }
    }
}

// ── Handler seam ────────────────────────────────────────────────────

/// One implementation of the routing logic.
///
/// The new pipeline and the legacy adapter both implement this so the
/// migration layer can run either, or both, for the same message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Implementation name for logs.
    fn name(&self) -> &str;

    /// Route one message. Never fails: errors are reported in the result.
    async fn handle(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult;

    /// Compute the result for comparison only, without replying to the
    /// contact or changing stored state. Handlers with no dry-run mode
    /// fall back to [`Self::handle`].
    async fn handle_shadow(&self, message: &InboundMessage, correlation_id: Uuid) -> PipelineResult {
        self.handle(message, correlation_id).await
    }
}
