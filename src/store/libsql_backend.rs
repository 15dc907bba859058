//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::migration::Implementation;
use crate::migration::comparator::{ComparisonResult, Severity};
use crate::migration::health::CallSample;
use crate::pipeline::area::Area;
use crate::pipeline::types::{ConversationContext, ConversationPatch, Lifecycle};
use crate::store::migrations;
use crate::store::traits::{
    Database, Direction, HandoffRecord, InteractionLog, Ticket, TicketPriority, TicketStatus,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Unknown area keys fall back to the default queue.
fn parse_area(s: &str) -> Area {
    s.parse().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Unknown area in store, using default");
        Area::DEFAULT
    })
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<DateTime<Utc>>` to an RFC 3339 libsql Value.
fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(dt.to_rfc3339()),
        None => libsql::Value::Null,
    }
}

fn opt_int(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &impl serde::Serialize) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Column order matches CONVERSATION_COLUMNS.
const CONVERSATION_COLUMNS: &str = "id, contact, area, sub_label, lifecycle, menu_position, \
     last_option, window_expires_at, is_lead, lead_expires_at, last_handoff_at, handoff_count, \
     disconnected_from_default, proxy_active, proxy_target, automatic_messages, origin, \
     ticket_id, metadata, created_at, last_interaction_at";

fn row_to_conversation(row: &libsql::Row) -> Result<ConversationContext, libsql::Error> {
    let area_str: String = row.get(2)?;
    let lifecycle_str: String = row.get(4)?;
    let window_str: String = row.get(7)?;
    let lead_expires_str: Option<String> = row.get(9).ok();
    let last_handoff_str: Option<String> = row.get(10).ok();
    let proxy_target_str: Option<String> = row.get(14).ok();
    let metadata_str: String = row.get::<String>(18).unwrap_or_else(|_| "{}".into());
    let created_str: String = row.get(19)?;
    let last_interaction_str: String = row.get(20)?;

    Ok(ConversationContext {
        id: row.get(0)?,
        contact: row.get(1)?,
        area: parse_area(&area_str),
        sub_label: row.get(3).ok(),
        lifecycle: Lifecycle::from_db(&lifecycle_str),
        menu_position: row.get(5).ok(),
        last_option: row
            .get::<i64>(6)
            .ok()
            .and_then(|n| u8::try_from(n).ok()),
        window_expires_at: parse_datetime(&window_str),
        is_lead: row.get::<i64>(8).unwrap_or(0) != 0,
        lead_expires_at: parse_optional_datetime(&lead_expires_str),
        last_handoff_at: parse_optional_datetime(&last_handoff_str),
        handoff_count: row.get::<i64>(11).unwrap_or(0).max(0) as u32,
        disconnected_from_default: row.get::<i64>(12).unwrap_or(0) != 0,
        proxy_active: row.get::<i64>(13).unwrap_or(0) != 0,
        proxy_target: proxy_target_str.as_deref().and_then(|s| s.parse().ok()),
        automatic_messages: row.get::<i64>(15).unwrap_or(0).max(0) as u32,
        origin: row.get(16).ok(),
        ticket_id: row.get(17).ok(),
        metadata: serde_json::from_str(&metadata_str).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_datetime(&created_str),
        last_interaction_at: parse_datetime(&last_interaction_str),
    })
}

const HANDOFF_COLUMNS: &str =
    "id, conversation_id, origin, destination, reason, correlation_id, created_at";

fn row_to_handoff(row: &libsql::Row) -> Result<HandoffRecord, libsql::Error> {
    let origin: String = row.get(2)?;
    let destination: String = row.get(3)?;
    let correlation: String = row.get(5)?;
    let created: String = row.get(6)?;
    Ok(HandoffRecord {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        origin: parse_area(&origin),
        destination: parse_area(&destination),
        reason: row.get(4)?,
        correlation_id: parse_uuid(&correlation),
        created_at: parse_datetime(&created),
    })
}

const TICKET_COLUMNS: &str =
    "id, handoff_id, conversation_id, destination, status, priority, created_at";

fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, libsql::Error> {
    let destination: String = row.get(3)?;
    let status: String = row.get(4)?;
    let priority: String = row.get(5)?;
    let created: String = row.get(6)?;
    Ok(Ticket {
        id: row.get(0)?,
        handoff_id: row.get(1)?,
        conversation_id: row.get(2)?,
        destination: parse_area(&destination),
        status: TicketStatus::from_db(&status),
        priority: TicketPriority::from_db(&priority),
        created_at: parse_datetime(&created),
    })
}

const LOG_COLUMNS: &str = "id, conversation_id, direction, content, channel_message_id, \
     correlation_id, metadata, created_at";

fn row_to_log(row: &libsql::Row) -> Result<InteractionLog, libsql::Error> {
    let direction: String = row.get(2)?;
    let correlation: String = row.get(5)?;
    let metadata: String = row.get::<String>(6).unwrap_or_else(|_| "{}".into());
    let created: String = row.get(7)?;
    Ok(InteractionLog {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        direction: Direction::from_db(&direction),
        content: row.get(3)?,
        channel_message_id: row.get(4).ok(),
        correlation_id: parse_uuid(&correlation),
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| serde_json::json!({})),
        created_at: parse_datetime(&created),
    })
}

const COMPARISON_COLUMNS: &str =
    "correlation_id, differences_found, severity, actionable, details, compared_at";

fn row_to_comparison(row: &libsql::Row) -> Result<ComparisonResult, libsql::Error> {
    let correlation: String = row.get(0)?;
    let severity: String = row.get(2)?;
    let details: String = row.get::<String>(4).unwrap_or_else(|_| "[]".into());
    let compared: String = row.get(5)?;
    Ok(ComparisonResult {
        correlation_id: parse_uuid(&correlation),
        compared_at: parse_datetime(&compared),
        differences_found: row.get::<i64>(1).unwrap_or(0) != 0,
        severity: Severity::from_db(&severity),
        details: serde_json::from_str(&details).unwrap_or_default(),
        actionable: row.get::<i64>(3).unwrap_or(0) != 0,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Conversations ───────────────────────────────────────────────

    async fn upsert_conversation(&self, ctx: &ConversationContext) -> Result<(), DatabaseError> {
        let metadata = to_json(&ctx.metadata)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO conversations ({CONVERSATION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21) \
                     ON CONFLICT(contact) DO UPDATE SET last_interaction_at = excluded.last_interaction_at"
                ),
                params![
                    ctx.id.as_str(),
                    ctx.contact.as_str(),
                    ctx.area.as_str(),
                    opt_text(ctx.sub_label.as_deref()),
                    ctx.lifecycle.as_str(),
                    opt_text(ctx.menu_position.as_deref()),
                    opt_int(ctx.last_option.map(i64::from)),
                    ctx.window_expires_at.to_rfc3339(),
                    ctx.is_lead as i64,
                    opt_datetime(ctx.lead_expires_at),
                    opt_datetime(ctx.last_handoff_at),
                    ctx.handoff_count as i64,
                    ctx.disconnected_from_default as i64,
                    ctx.proxy_active as i64,
                    opt_text(ctx.proxy_target.map(|a| a.as_str())),
                    ctx.automatic_messages as i64,
                    opt_text(ctx.origin.as_deref()),
                    opt_text(ctx.ticket_id.as_deref()),
                    metadata,
                    ctx.created_at.to_rfc3339(),
                    ctx.last_interaction_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_conversation: {e}")))?;

        debug!(contact = %ctx.contact, "Conversation upserted");
        Ok(())
    }

    async fn get_conversation(
        &self,
        contact: &str,
    ) -> Result<Option<ConversationContext>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE contact = ?1"),
                params![contact],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_conversation: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ctx = row_to_conversation(&row).map_err(|e| {
                    DatabaseError::Query(format!("get_conversation row parse: {e}"))
                })?;
                Ok(Some(ctx))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_conversation: {e}"))),
        }
    }

    async fn update_conversation(
        &self,
        contact: &str,
        patch: &ConversationPatch,
    ) -> Result<(), DatabaseError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut ctx =
            self.get_conversation(contact)
                .await?
                .ok_or_else(|| DatabaseError::NotFound {
                    entity: "conversation".into(),
                    id: contact.to_string(),
                })?;
        patch.apply(&mut ctx);

        self.conn()
            .execute(
                "UPDATE conversations SET area = ?1, sub_label = ?2, lifecycle = ?3, \
                 menu_position = ?4, last_option = ?5, last_handoff_at = ?6, handoff_count = ?7, \
                 ticket_id = ?8, proxy_active = ?9, proxy_target = ?10, automatic_messages = ?11 \
                 WHERE contact = ?12",
                params![
                    ctx.area.as_str(),
                    opt_text(ctx.sub_label.as_deref()),
                    ctx.lifecycle.as_str(),
                    opt_text(ctx.menu_position.as_deref()),
                    opt_int(ctx.last_option.map(i64::from)),
                    opt_datetime(ctx.last_handoff_at),
                    ctx.handoff_count as i64,
                    opt_text(ctx.ticket_id.as_deref()),
                    ctx.proxy_active as i64,
                    opt_text(ctx.proxy_target.map(|a| a.as_str())),
                    ctx.automatic_messages as i64,
                    contact,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_conversation: {e}")))?;

        debug!(contact, area = %ctx.area, "Conversation updated");
        Ok(())
    }

    // ── Handoffs & tickets ──────────────────────────────────────────

    async fn insert_handoff(&self, record: &HandoffRecord) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO handoffs ({HANDOFF_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    record.id.as_str(),
                    record.conversation_id.as_str(),
                    record.origin.as_str(),
                    record.destination.as_str(),
                    record.reason.as_str(),
                    record.correlation_id.to_string(),
                    record.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_handoff: {e}")))?;
        Ok(())
    }

    async fn delete_handoff(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM handoffs WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_handoff: {e}")))?;
        Ok(count > 0)
    }

    async fn list_handoffs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<HandoffRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {HANDOFF_COLUMNS} FROM handoffs WHERE conversation_id = ?1 ORDER BY created_at ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_handoffs: {e}")))?;

        let mut handoffs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_handoff(&row) {
                Ok(h) => handoffs.push(h),
                Err(e) => tracing::warn!("Skipping handoff row: {e}"),
            }
        }
        Ok(handoffs)
    }

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!("INSERT INTO tickets ({TICKET_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    ticket.id.as_str(),
                    ticket.handoff_id.as_str(),
                    ticket.conversation_id.as_str(),
                    ticket.destination.as_str(),
                    ticket.status.as_str(),
                    ticket.priority.as_str(),
                    ticket.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_ticket: {e}")))?;
        Ok(())
    }

    async fn delete_ticket(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM tickets WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_ticket: {e}")))?;
        Ok(count > 0)
    }

    async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_ticket: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_ticket(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_ticket row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_ticket: {e}"))),
        }
    }

    // ── Interaction logs ────────────────────────────────────────────

    async fn insert_interaction_log(&self, log: &InteractionLog) -> Result<(), DatabaseError> {
        let metadata = to_json(&log.metadata)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO interaction_logs ({LOG_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                ),
                params![
                    log.id.as_str(),
                    log.conversation_id.as_str(),
                    log.direction.as_str(),
                    log.content.as_str(),
                    opt_text(log.channel_message_id.as_deref()),
                    log.correlation_id.to_string(),
                    metadata,
                    log.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_interaction_log: {e}")))?;
        Ok(())
    }

    async fn latest_outbound_log(
        &self,
        conversation_id: &str,
    ) -> Result<Option<InteractionLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM interaction_logs \
                     WHERE conversation_id = ?1 AND direction = 'outbound' \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_outbound_log: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_log(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("latest_outbound_log row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_outbound_log: {e}"))),
        }
    }

    async fn set_log_channel_message_id(
        &self,
        log_id: &str,
        channel_message_id: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE interaction_logs SET channel_message_id = ?1 WHERE id = ?2",
                params![channel_message_id, log_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_log_channel_message_id: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "interaction_log".into(),
                id: log_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_interaction_logs(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<InteractionLog>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {LOG_COLUMNS} FROM interaction_logs WHERE conversation_id = ?1 \
                     ORDER BY created_at ASC, rowid ASC"
                ),
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_interaction_logs: {e}")))?;

        let mut logs = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_log(&row) {
                Ok(log) => logs.push(log),
                Err(e) => tracing::warn!("Skipping interaction log row: {e}"),
            }
        }
        Ok(logs)
    }

    // ── Migration telemetry ─────────────────────────────────────────

    async fn record_health_sample(
        &self,
        implementation: Implementation,
        sample: &CallSample,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO health_samples (implementation, success, latency_ms, error, recorded_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    implementation.as_str(),
                    sample.success as i64,
                    sample.latency_ms as i64,
                    opt_text(sample.error.as_deref()),
                    sample.at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_health_sample: {e}")))?;
        Ok(())
    }

    async fn record_comparison(&self, result: &ComparisonResult) -> Result<(), DatabaseError> {
        let details = to_json(&result.details)?;
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO comparison_samples ({COMPARISON_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
                ),
                params![
                    result.correlation_id.to_string(),
                    result.differences_found as i64,
                    result.severity.as_str(),
                    result.actionable as i64,
                    details,
                    result.compared_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_comparison: {e}")))?;
        Ok(())
    }

    async fn recent_comparisons(
        &self,
        limit: usize,
    ) -> Result<Vec<ComparisonResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMPARISON_COLUMNS} FROM comparison_samples \
                     ORDER BY compared_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_comparisons: {e}")))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_comparison(&row) {
                Ok(r) => results.push(r),
                Err(e) => tracing::warn!("Skipping comparison row: {e}"),
            }
        }
        Ok(results)
    }
}
