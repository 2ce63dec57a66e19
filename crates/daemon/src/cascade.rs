//! Failure propagation across an orchestrator group.

use crate::db::Db;
use crate::reqlog::RequestLog;
use dispatch_core::model::{Task, TaskStatus};
use dispatch_core::orchestrator::{in_group, orchestrator_ref};
use tracing::warn;

/// Propagate a terminal `Failed`/`Cancelled` from `trigger` to every other
/// non-terminal task sharing its orchestrator root (the root included, unless
/// the root is the trigger itself). Returns how many tasks were marked.
///
/// Best-effort: a failure to mark one related task is logged and never rolls
/// back or blocks the others, and never escalates to the triggering update.
pub async fn propagate(
    db: &Db,
    rlog: &mut RequestLog,
    trigger: &Task,
    status: TaskStatus,
) -> usize {
    debug_assert!(matches!(status, TaskStatus::Failed | TaskStatus::Cancelled));

    let Some(root) = orchestrator_ref(trigger) else {
        return 0;
    };
    let root_id = root.orchestrator_id;

    let candidates = match db.non_terminal_tasks().await {
        Ok(tasks) => tasks,
        Err(e) => {
            warn!(error = %e, "cascade: failed to load candidate tasks");
            rlog.push(format!("cascade aborted: {e}"));
            return 0;
        }
    };

    let message = format!("Cascaded {status} from task {}", trigger.id);
    let mut marked = 0;
    for task in candidates
        .iter()
        .filter(|t| t.id != trigger.id && in_group(t, &root_id))
    {
        match db.cascade_mark(&task.id, status, &message).await {
            Ok(true) => {
                marked += 1;
                rlog.push(format!("cascaded {status} to {}", task.id));
            }
            // Raced into a terminal state between the read and the write;
            // terminal tasks are left untouched.
            Ok(false) => {}
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cascade: failed to mark related task");
                rlog.push(format!("cascade to {} failed: {e}", task.id));
            }
        }
    }
    marked
}
