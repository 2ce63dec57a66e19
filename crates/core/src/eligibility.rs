//! Pure eligibility analysis over a task snapshot.
//!
//! This module decides, without touching storage, which tasks a caller may
//! legally claim right now and why every other candidate is excluded. The
//! daemon loads a snapshot, runs one pass, and applies the result with a
//! single conditional update.

use crate::model::{Id, Task, TaskStatus, UserGate, MAX_IN_PROGRESS_PER_USER};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which pool the caller draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Service-role fleet: global scope, spends user credits.
    Cloud,
    /// User-token caller working their own projects on their own compute.
    Local,
}

/// Why a candidate task was excluded from the eligible set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Exclusion {
    /// Orchestrator task types are never directly claimable.
    Orchestrator,
    /// Candidate is not `Queued` (only reachable with `include_active`).
    NotQueued { status: TaskStatus },
    /// The task's project or its owning user could not be resolved.
    OwnerUnresolved,
    /// Owner has no credit balance (cloud pool only).
    NoCredits,
    CloudProcessingDisabled,
    LocalProcessingDisabled,
    /// Owner is at the per-user `In Progress` ceiling, counting claims
    /// granted earlier in this same pass.
    ConcurrencyCeiling { in_progress: usize },
    /// `dependant_on` has not reached `Complete`.
    DependencyIncomplete {
        dependency: Id,
        #[serde(default)]
        status: Option<TaskStatus>,
    },
}

/// Immutable inputs for one eligibility pass.
pub struct Snapshot<'a> {
    /// Candidate tasks, any order.
    pub tasks: &'a [Task],
    /// project id -> owning user id.
    pub project_owners: &'a HashMap<Id, Id>,
    /// user id -> gating state.
    pub user_gates: &'a HashMap<Id, UserGate>,
    /// referenced dependency task id -> its current status.
    pub dependency_status: &'a HashMap<Id, TaskStatus>,
}

/// Outcome of one pass: FIFO-ordered eligible tasks plus the exclusion
/// breakdown for diagnostics.
#[derive(Debug, Default)]
pub struct Analysis {
    pub eligible: Vec<Task>,
    pub excluded: Vec<(Task, Exclusion)>,
}

/// Run the exclusion rules over the snapshot for one caller pool.
///
/// `run_type` restricts the candidate pool to one task type before any rule
/// runs. Ordering among eligible tasks is earliest `created_at` first, ties
/// broken by id.
pub fn analyze(snap: &Snapshot<'_>, pool: Pool, run_type: Option<&str>) -> Analysis {
    let mut ordered: Vec<&Task> = snap
        .tasks
        .iter()
        .filter(|t| run_type.map_or(true, |rt| t.task_type == rt))
        .collect();
    ordered.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });

    // Claims granted earlier in this pass count against the ceiling.
    let mut granted: HashMap<&str, usize> = HashMap::new();
    let mut analysis = Analysis::default();

    for task in ordered {
        match exclusion(snap, pool, &granted, task) {
            Some(reason) => analysis.excluded.push((task.clone(), reason)),
            None => {
                if let Some(owner) = snap.project_owners.get(&task.project_id) {
                    *granted.entry(owner.as_str()).or_default() += 1;
                }
                analysis.eligible.push(task.clone());
            }
        }
    }

    analysis
}

fn exclusion(
    snap: &Snapshot<'_>,
    pool: Pool,
    granted: &HashMap<&str, usize>,
    task: &Task,
) -> Option<Exclusion> {
    if task.status != TaskStatus::Queued {
        return Some(Exclusion::NotQueued {
            status: task.status,
        });
    }
    if task.is_orchestrator() {
        return Some(Exclusion::Orchestrator);
    }

    let Some(owner) = snap.project_owners.get(&task.project_id) else {
        return Some(Exclusion::OwnerUnresolved);
    };
    let Some(gate) = snap.user_gates.get(owner) else {
        return Some(Exclusion::OwnerUnresolved);
    };

    if pool == Pool::Cloud && gate.credits <= 0.0 {
        return Some(Exclusion::NoCredits);
    }

    match pool {
        Pool::Cloud if !gate.settings.allow_cloud => {
            return Some(Exclusion::CloudProcessingDisabled)
        }
        Pool::Local if !gate.settings.allow_local => {
            return Some(Exclusion::LocalProcessingDisabled)
        }
        _ => {}
    }

    let in_progress = gate.in_progress + granted.get(owner.as_str()).copied().unwrap_or(0);
    if in_progress >= MAX_IN_PROGRESS_PER_USER {
        return Some(Exclusion::ConcurrencyCeiling { in_progress });
    }

    if let Some(dep) = &task.dependant_on {
        let status = snap.dependency_status.get(dep).copied();
        if status != Some(TaskStatus::Complete) {
            return Some(Exclusion::DependencyIncomplete {
                dependency: dep.clone(),
                status,
            });
        }
    }

    None
}
