//! Persistence layer: libSQL-backed storage for conversations, handoffs,
//! tickets, interaction logs and migration telemetry.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Direction, HandoffRecord, InteractionLog, Ticket};
