//! Shadow-mode diff of legacy vs new pipeline results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::MigrationError;
use crate::pipeline::types::PipelineResult;

/// Latency gap worth recording.
pub const LATENCY_RECORD_MS: u64 = 50;
/// New slower than legacy by more than this escalates to a warning.
pub const LATENCY_REGRESSION_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }
}

/// One field that differs between the two results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Difference {
    pub field: String,
    pub legacy: Value,
    pub new: Value,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub correlation_id: Uuid,
    pub compared_at: DateTime<Utc>,
    pub differences_found: bool,
    pub severity: Severity,
    pub details: Vec<Difference>,
    /// Someone should look at this divergence.
    pub actionable: bool,
}

impl ComparisonResult {
    /// Result reported when the comparison itself could not run.
    fn comparison_error(correlation_id: Uuid, error: &MigrationError) -> Self {
        Self {
            correlation_id,
            compared_at: Utc::now(),
            differences_found: true,
            severity: Severity::Critical,
            details: vec![Difference {
                field: "comparison_error".into(),
                legacy: Value::Null,
                new: Value::Null,
                severity: Severity::Critical,
                note: Some(error.to_string()),
            }],
            actionable: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResponseComparator {
    latency_record_ms: u64,
    latency_regression_ms: u64,
}

impl Default for ResponseComparator {
    fn default() -> Self {
        Self {
            latency_record_ms: LATENCY_RECORD_MS,
            latency_regression_ms: LATENCY_REGRESSION_MS,
        }
    }
}

fn to_value<T: Serialize>(field: &str, v: &T) -> Result<Value, MigrationError> {
    serde_json::to_value(v).map_err(|e| MigrationError::Comparison(format!("{field}: {e}")))
}

impl ResponseComparator {
    /// Compare two results. Never fails: internal errors become a critical,
    /// actionable `comparison_error` result.
    pub fn compare(
        &self,
        correlation_id: Uuid,
        legacy: &PipelineResult,
        new: &PipelineResult,
    ) -> ComparisonResult {
        match self.try_compare(correlation_id, legacy, new) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(correlation_id = %correlation_id, "Comparison failed: {e}");
                ComparisonResult::comparison_error(correlation_id, &e)
            }
        }
    }

    fn try_compare(
        &self,
        correlation_id: Uuid,
        legacy: &PipelineResult,
        new: &PipelineResult,
    ) -> Result<ComparisonResult, MigrationError> {
        let mut details = Vec::new();
        let mut severity = Severity::Info;
        let mut actionable = false;

        if legacy.success != new.success {
            details.push(Difference {
                field: "success".into(),
                legacy: Value::Bool(legacy.success),
                new: Value::Bool(new.success),
                severity: Severity::Critical,
                note: new.error.clone().or_else(|| legacy.error.clone()),
            });
            severity = Severity::Critical;
            actionable = true;
        }

        if legacy.success && new.success && legacy.action != new.action {
            details.push(Difference {
                field: "action".into(),
                legacy: to_value("action", &legacy.action)?,
                new: to_value("action", &new.action)?,
                severity: Severity::Warning,
                note: None,
            });
            severity = severity.max(Severity::Warning);
            actionable = true;
        }

        let either_target = legacy.target_queue.is_some() || new.target_queue.is_some();
        if either_target && legacy.target_queue != new.target_queue {
            details.push(Difference {
                field: "target_queue".into(),
                legacy: to_value("target_queue", &legacy.target_queue)?,
                new: to_value("target_queue", &new.target_queue)?,
                severity: Severity::Warning,
                note: None,
            });
            severity = severity.max(Severity::Warning);
            actionable = true;
        }

        let gap = legacy.elapsed_ms.abs_diff(new.elapsed_ms);
        if gap > self.latency_record_ms {
            let regression =
                new.elapsed_ms > legacy.elapsed_ms && gap > self.latency_regression_ms;
            let field_severity = if regression {
                Severity::Warning
            } else {
                Severity::Info
            };
            details.push(Difference {
                field: "elapsed_ms".into(),
                legacy: Value::from(legacy.elapsed_ms),
                new: Value::from(new.elapsed_ms),
                severity: field_severity,
                note: regression.then(|| format!("new slower by {gap}ms")),
            });
            if regression {
                severity = severity.max(Severity::Warning);
                actionable = true;
            }
        }

        Ok(ComparisonResult {
            correlation_id,
            compared_at: Utc::now(),
            differences_found: !details.is_empty(),
            severity,
            details,
            actionable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ActionKind;

    fn result(action: ActionKind, target: Option<&str>, elapsed_ms: u64) -> PipelineResult {
        PipelineResult {
            success: true,
            correlation_id: Uuid::new_v4(),
            elapsed_ms,
            conversation_id: Some("conv-1".into()),
            action: Some(action),
            target_queue: target.map(String::from),
            ticket_id: None,
            error: None,
            error_kind: None,
        }
    }

    #[test]
    fn identical_results_have_no_differences() {
        let a = result(ActionKind::ShowMenu, None, 40);
        let b = result(ActionKind::ShowMenu, None, 60);
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert!(!cmp.differences_found);
        assert_eq!(cmp.severity, Severity::Info);
        assert!(!cmp.actionable);
    }

    #[test]
    fn success_mismatch_is_critical() {
        let a = result(ActionKind::ShowMenu, None, 40);
        let b = PipelineResult::failure(Uuid::new_v4(), 40, "store down");
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert_eq!(cmp.severity, Severity::Critical);
        assert!(cmp.actionable);
        assert_eq!(cmp.details[0].field, "success");
        assert_eq!(cmp.details[0].note.as_deref(), Some("store down"));
    }

    #[test]
    fn target_mismatch_is_actionable_warning() {
        let a = result(ActionKind::HandOff, Some("admin"), 40);
        let b = result(ActionKind::HandOff, Some("ventas"), 45);
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert!(cmp.differences_found);
        assert!(cmp.severity >= Severity::Warning);
        assert!(cmp.actionable);
        assert_eq!(cmp.details.len(), 1);
        assert_eq!(cmp.details[0].legacy, "admin");
    }

    #[test]
    fn action_mismatch_keeps_critical() {
        let a = result(ActionKind::ShowMenu, None, 40);
        let mut b = result(ActionKind::HandOff, Some("admin"), 40);
        b.success = false;
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        // Action is not compared when one side failed; success + target are.
        assert_eq!(cmp.severity, Severity::Critical);
        assert!(cmp.details.iter().all(|d| d.field != "action"));
        assert!(cmp.details.iter().any(|d| d.field == "target_queue"));
    }

    #[test]
    fn small_latency_gap_is_recorded_only() {
        let a = result(ActionKind::ShowMenu, None, 100);
        let b = result(ActionKind::ShowMenu, None, 180);
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert!(cmp.differences_found);
        assert_eq!(cmp.severity, Severity::Info);
        assert!(!cmp.actionable);
    }

    #[test]
    fn new_much_slower_escalates() {
        let a = result(ActionKind::ShowMenu, None, 100);
        let b = result(ActionKind::ShowMenu, None, 250);
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert_eq!(cmp.severity, Severity::Warning);
        assert!(cmp.actionable);
    }

    #[test]
    fn new_much_faster_is_not_a_regression() {
        let a = result(ActionKind::ShowMenu, None, 400);
        let b = result(ActionKind::ShowMenu, None, 100);
        let cmp = ResponseComparator::default().compare(Uuid::new_v4(), &a, &b);
        assert!(cmp.differences_found);
        assert_eq!(cmp.severity, Severity::Info);
        assert!(!cmp.actionable);
    }

    #[test]
    fn comparison_error_shape() {
        let id = Uuid::new_v4();
        let cmp = ComparisonResult::comparison_error(
            id,
            &MigrationError::Comparison("bad payload".into()),
        );
        assert_eq!(cmp.correlation_id, id);
        assert_eq!(cmp.severity, Severity::Critical);
        assert!(cmp.actionable);
        assert_eq!(cmp.details[0].field, "comparison_error");
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert_eq!(Severity::from_db("critical"), Severity::Critical);
    }
}
