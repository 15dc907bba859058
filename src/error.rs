//! Error types for the lead router.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging channel and notification sink errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("Notification to {target} failed: {reason}")]
    NotifyFailed { target: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors raised while processing a message through the pipeline.
///
/// Variants mirror the failure taxonomy surfaced to callers: the pipeline
/// never propagates these past its boundary, it reports them in the result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid contact identifier: {0}")]
    InvalidContact(String),

    #[error("Ingest failed: {0}")]
    IngestFailure(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Handoff step {step} failed: {reason}")]
    HandoffCompensationFailure {
        step: String,
        reason: String,
        /// Compensating steps that themselves failed.
        compensation_errors: Vec<String>,
    },

    #[error("Send failed: {0}")]
    SendFailure(String),

    #[error("Routing fell back to legacy: {0}")]
    RoutingFallback(String),

    #[error("Store error: {0}")]
    Database(#[from] DatabaseError),
}

impl PipelineError {
    /// Short label for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidContact(_) => "invalid_contact",
            Self::IngestFailure(_) => "ingest_failure",
            Self::SystemError(_) => "system_error",
            Self::HandoffCompensationFailure { .. } => "handoff_compensation_failure",
            Self::SendFailure(_) => "send_failure",
            Self::RoutingFallback(_) => "routing_fallback",
            Self::Database(_) => "database",
        }
    }
}

/// Migration control-plane errors.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Invalid rollout percentage {0}: must be between 0 and 100")]
    InvalidPercentage(u32),

    #[error("Cannot bucket contact: {0}")]
    Bucketing(String),

    #[error("Implementation {implementation} task failed: {reason}")]
    TaskFailed {
        implementation: String,
        reason: String,
    },

    #[error("Comparison failed: {0}")]
    Comparison(String),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
