//! Migration layer: splits live traffic between the legacy and the new
//! routing implementation, compares their outputs in shadow mode and
//! rolls back automatically when the new one regresses.

pub mod comparator;
pub mod controller;
pub mod health;
pub mod legacy;
pub mod router;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use comparator::{ComparisonResult, ResponseComparator, Severity};
pub use controller::{ControllerResponse, MigrationController, MigrationStatus};
pub use health::{HealthMetrics, HealthSnapshot, HealthStatus};
pub use legacy::LegacyHttpHandler;
pub use router::{RolloutMode, RoutingConfig, RoutingDecision, TrafficRouter};

/// Which implementation serves a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Implementation {
    Legacy,
    New,
    /// Shadow: both run, legacy is authoritative.
    Both,
}

impl Implementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::New => "new",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
