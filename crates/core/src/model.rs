use crate::util::EpochMs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A globally unique identifier (UUID as string by convention).
pub type Id = String;

/// Task types containing this substring are never directly claimable and act
/// as the root of a cascade group.
pub const ORCHESTRATOR_TAG: &str = "orchestrator";

/// Per-user ceiling on `In Progress` tasks, summed across all their projects.
pub const MAX_IN_PROGRESS_PER_USER: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Queued,
    #[serde(rename = "In Progress")]
    InProgress,
    Complete,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::InProgress => "In Progress",
            TaskStatus::Complete => "Complete",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Terminal-immutability guard: whether an update from `self` to `next`
    /// is accepted. `Cancelled` accepts nothing; `Complete` accepts only an
    /// idempotent re-complete.
    pub fn accepts(self, next: TaskStatus) -> Result<(), TransitionError> {
        match self {
            TaskStatus::Cancelled => Err(TransitionError::CancelledIsFinal),
            TaskStatus::Complete if next != TaskStatus::Complete => {
                Err(TransitionError::CompleteIsFinal(next))
            }
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("task is Cancelled; no further status updates are accepted")]
    CancelledIsFinal,
    #[error("a Complete task cannot be marked {}", .0.as_str())]
    CompleteIsFinal(TaskStatus),
}

/// A unit of work in the shared queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub project_id: Id,
    pub task_type: String,
    pub status: TaskStatus,
    pub params: Value,
    #[serde(default)]
    pub dependant_on: Option<Id>,
    /// Claiming agent; set only on service-role (cloud) claims.
    #[serde(default)]
    pub worker_id: Option<String>,
    pub created_at: EpochMs,
    pub updated_at: EpochMs,
    #[serde(default)]
    pub generation_started_at: Option<EpochMs>,
    #[serde(default)]
    pub generation_processed_at: Option<EpochMs>,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl Task {
    pub fn is_orchestrator(&self) -> bool {
        self.task_type.contains(ORCHESTRATOR_TAG)
    }
}

/// Per-user processing preferences. Both flags default to true when the
/// stored settings omit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingSettings {
    pub allow_local: bool,
    pub allow_cloud: bool,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            allow_local: true,
            allow_cloud: true,
        }
    }
}

impl ProcessingSettings {
    pub fn from_value(settings: &Value) -> Self {
        let flag = |key: &str| {
            settings
                .get(key)
                .and_then(Value::as_bool)
                .unwrap_or(true)
        };
        Self {
            allow_local: flag("allow_local_processing"),
            allow_cloud: flag("allow_cloud_processing"),
        }
    }
}

/// Gating snapshot for one task owner, read once per eligibility pass.
#[derive(Debug, Clone)]
pub struct UserGate {
    pub credits: f64,
    pub settings: ProcessingSettings,
    /// Persisted `In Progress` count across every project the user owns.
    pub in_progress: usize,
}
