//! Handoff saga: forward steps with compensations, run in order.
//!
//! The store has no multi-statement transactions, so a handoff (record,
//! ticket, conversation update) is applied step by step. When a step fails,
//! every step that already completed is compensated in reverse order and
//! the failure is reported with any compensation errors attached.

use async_trait::async_trait;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, PipelineError};
use crate::pipeline::types::ConversationPatch;
use crate::store::Database;
use crate::store::traits::{HandoffRecord, Ticket};

/// One forward action and its compensation.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError>;

    /// Undo a completed `execute`. Only called after `execute` succeeded.
    async fn compensate(&self, db: &dyn Database) -> Result<(), DatabaseError>;
}

/// Runs steps in order and compensates on failure.
pub struct Saga<'a> {
    db: &'a dyn Database,
    correlation_id: Uuid,
    steps: Vec<Box<dyn SagaStep + 'a>>,
}

impl<'a> Saga<'a> {
    pub fn new(db: &'a dyn Database, correlation_id: Uuid) -> Self {
        Self {
            db,
            correlation_id,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: impl SagaStep + 'a) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub async fn run(self) -> Result<(), PipelineError> {
        let mut completed: Vec<&dyn SagaStep> = Vec::with_capacity(self.steps.len());

        for step in &self.steps {
            match step.execute(self.db).await {
                Ok(()) => {
                    debug!(correlation_id = %self.correlation_id, step = step.name(), "Saga step done");
                    completed.push(step.as_ref());
                }
                Err(e) => {
                    warn!(
                        correlation_id = %self.correlation_id,
                        step = step.name(),
                        error = %e,
                        "Saga step failed, compensating"
                    );
                    let mut compensation_errors = Vec::new();
                    for done in completed.iter().rev() {
                        if let Err(ce) = done.compensate(self.db).await {
                            error!(
                                correlation_id = %self.correlation_id,
                                step = done.name(),
                                error = %ce,
                                "Compensation failed"
                            );
                            compensation_errors.push(format!("{}: {ce}", done.name()));
                        }
                    }
                    return Err(PipelineError::HandoffCompensationFailure {
                        step: step.name().to_string(),
                        reason: e.to_string(),
                        compensation_errors,
                    });
                }
            }
        }
        Ok(())
    }
}

// ── Handoff steps ───────────────────────────────────────────────────

pub struct CreateHandoffRecord<'a>(pub &'a HandoffRecord);

#[async_trait]
impl SagaStep for CreateHandoffRecord<'_> {
    fn name(&self) -> &str {
        "create_handoff"
    }

    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        db.insert_handoff(self.0).await
    }

    async fn compensate(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        if !db.delete_handoff(&self.0.id).await? {
            warn!(handoff_id = %self.0.id, "Handoff already gone during compensation");
        }
        Ok(())
    }
}

pub struct CreateTicket<'a>(pub &'a Ticket);

#[async_trait]
impl SagaStep for CreateTicket<'_> {
    fn name(&self) -> &str {
        "create_ticket"
    }

    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        db.insert_ticket(self.0).await
    }

    async fn compensate(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        if !db.delete_ticket(&self.0.id).await? {
            warn!(ticket_id = %self.0.id, "Ticket already gone during compensation");
        }
        Ok(())
    }
}

/// Apply `patch`; compensation applies `revert`.
pub struct UpdateConversation<'a> {
    pub contact: &'a str,
    pub patch: ConversationPatch,
    pub revert: ConversationPatch,
}

#[async_trait]
impl SagaStep for UpdateConversation<'_> {
    fn name(&self) -> &str {
        "update_conversation"
    }

    async fn execute(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        db.update_conversation(self.contact, &self.patch).await
    }

    async fn compensate(&self, db: &dyn Database) -> Result<(), DatabaseError> {
        db.update_conversation(self.contact, &self.revert).await
    }
}
