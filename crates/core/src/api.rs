//! Request/response types for the daemon HTTP API.

use crate::eligibility::Exclusion;
use crate::model::{Id, TaskStatus};
use crate::util::EpochMs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Claim the next eligible task (or just count them with `dry_run`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimRequest {
    /// Recorded on the task for service-role claims; generated if omitted.
    #[serde(default)]
    pub worker_id: Option<String>,
    /// Count eligible tasks without claiming.
    #[serde(default)]
    pub dry_run: bool,
    /// Include `In Progress` tasks in the diagnostic pool.
    #[serde(default)]
    pub include_active: bool,
    /// Restrict the candidate pool to one task type.
    #[serde(default)]
    pub run_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub task_id: Id,
    pub params: Value,
    pub task_type: String,
    pub project_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    pub available_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskRequest {
    pub task_type: String,
    pub params: Value,
    /// Required; service-role callers name any project, users their own.
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default)]
    pub dependant_on: Option<Id>,
    /// Caller-supplied id; generated when absent.
    #[serde(default)]
    pub task_id: Option<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub task_id: Id,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub task_id: Id,
    pub status: TaskStatus,
    #[serde(default)]
    pub output_location: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusResponse {
    pub success: bool,
    pub task_id: Id,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputRequest {
    pub task_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutputResponse {
    pub status: TaskStatus,
    #[serde(default)]
    pub output_location: Option<String>,
    pub params: Value,
    #[serde(default)]
    pub dependant_on: Option<Id>,
}

/// "Why did nothing claim?" — the eligibility breakdown for a caller scope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExplainRequest {
    #[serde(default)]
    pub include_active: bool,
    #[serde(default)]
    pub run_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainResponse {
    pub available_tasks: usize,
    pub eligible_task_ids: Vec<Id>,
    pub excluded: Vec<ExcludedTask>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExcludedTask {
    pub task_id: Id,
    pub task_type: String,
    #[serde(flatten)]
    pub reason: Exclusion,
}

/// Recent-task summary used for scaling decisions and debugging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentTasksRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub task_type: Option<String>,
    /// Only tasks created in the last N hours.
    #[serde(default)]
    pub hours: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentTasksResponse {
    pub total_count: usize,
    pub status_distribution: BTreeMap<String, usize>,
    pub task_type_distribution: BTreeMap<String, usize>,
    pub worker_distribution: BTreeMap<String, usize>,
    pub timing: TimingStats,
    pub recent_errors: Vec<TaskErrorSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingStats {
    /// created_at -> generation_started_at, averaged.
    pub avg_queue_seconds: Option<f64>,
    /// generation_started_at -> generation_processed_at, averaged.
    pub avg_processing_seconds: Option<f64>,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorSummary {
    pub task_id: Id,
    pub task_type: String,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: EpochMs,
}

// Admin provisioning (service-role only).

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserRequest {
    #[serde(default)]
    pub user_id: Option<Id>,
    #[serde(default)]
    pub credits: f64,
    #[serde(default)]
    pub allow_local_processing: Option<bool>,
    #[serde(default)]
    pub allow_cloud_processing: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateUserResponse {
    pub user_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectRequest {
    pub user_id: Id,
    #[serde(default)]
    pub project_id: Option<Id>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateProjectResponse {
    pub project_id: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenRequest {
    pub user_id: Id,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTokenResponse {
    pub token: String,
}
