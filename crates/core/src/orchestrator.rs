//! Normalized decoding of the orchestrator reference embedded in task params.
//!
//! The reference historically appears in several shapes: a direct ref field,
//! a ref nested inside `orchestrator_details`, a ref inside a forwarded copy
//! of the original params, or the task itself carrying `orchestrator_details`
//! (the orchestrator root). All callers go through [`orchestrator_ref`] and
//! get one normalized answer.

use crate::model::{Id, Task};
use serde_json::Value;

/// Normalized orchestrator relationship for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorRef {
    /// Id of the orchestrator task rooting the cascade group.
    pub orchestrator_id: Id,
    /// True when the task *is* the root rather than a child referencing it.
    pub is_root: bool,
}

/// Decode the orchestrator relationship, checking shapes in priority order.
pub fn orchestrator_ref(task: &Task) -> Option<OrchestratorRef> {
    if let Some(id) = ref_field(&task.params) {
        return Some(OrchestratorRef {
            orchestrator_id: id,
            is_root: false,
        });
    }
    if let Some(id) = task.params.get("orchestrator_details").and_then(ref_field_of) {
        return Some(OrchestratorRef {
            orchestrator_id: id,
            is_root: false,
        });
    }
    if let Some(id) = task
        .params
        .get("original_params")
        .and_then(|p| p.get("orchestrator_details"))
        .and_then(ref_field_of)
    {
        return Some(OrchestratorRef {
            orchestrator_id: id,
            is_root: false,
        });
    }
    // A task holding orchestrator_details with no ref to another task is the
    // root of its own group.
    if task
        .params
        .get("orchestrator_details")
        .is_some_and(Value::is_object)
    {
        return Some(OrchestratorRef {
            orchestrator_id: task.id.clone(),
            is_root: true,
        });
    }
    None
}

/// Whether `task` belongs to the cascade group rooted at `root_id`.
pub fn in_group(task: &Task, root_id: &str) -> bool {
    if task.id == root_id {
        return true;
    }
    orchestrator_ref(task).is_some_and(|r| r.orchestrator_id == root_id)
}

fn ref_field(params: &Value) -> Option<Id> {
    ref_field_of(params)
}

fn ref_field_of(value: &Value) -> Option<Id> {
    for key in ["orchestrator_task_id", "orchestrator_task_id_ref"] {
        if let Some(id) = value.get(key).and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}
