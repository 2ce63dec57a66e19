use crate::config::DaemonConfig;
use anyhow::{Context, Result};
use dispatch_core::eligibility::Snapshot;
use dispatch_core::model::{
    Id, ProcessingSettings, Task, TaskStatus, UserGate, MAX_IN_PROGRESS_PER_USER,
};
use dispatch_core::{now_ms, EpochMs};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

use surrealdb::engine::any::{connect, Any};
use surrealdb::{RecordId, Surreal};

/// Decode target for the record echoed back by a `CREATE`. We discard the
/// value, but SurrealDB returns the generated `id` as a `RecordId`, which
/// does not deserialize into `serde_json::Value`; capturing it here lets the
/// insert succeed while the result is thrown away.
#[derive(Deserialize)]
struct Created {
    #[allow(dead_code)]
    id: RecordId,
}

/// Projection that returns record keys as plain id strings.
const TASK_FIELDS: &str = "record::id(id) AS id, project_id, task_type, status, params, \
     dependant_on, worker_id, created_at, updated_at, generation_started_at, \
     generation_processed_at, output_location, error_message";

#[derive(Clone)]
pub struct Db {
    inner: Surreal<Any>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Project {
    pub id: Id,
    pub user_id: Id,
    #[serde(default)]
    pub name: Option<String>,
    pub created_at: EpochMs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: Id,
    pub credits: f64,
    #[serde(default)]
    pub settings: Option<Value>,
    pub created_at: EpochMs,
}

/// Everything one eligibility pass reads, loaded in a handful of queries.
#[derive(Debug, Default)]
pub struct SnapshotData {
    pub tasks: Vec<Task>,
    pub project_owners: HashMap<Id, Id>,
    pub user_gates: HashMap<Id, UserGate>,
    pub dependency_status: HashMap<Id, TaskStatus>,
}

impl SnapshotData {
    pub fn as_refs(&self) -> Snapshot<'_> {
        Snapshot {
            tasks: &self.tasks,
            project_owners: &self.project_owners,
            user_gates: &self.user_gates,
            dependency_status: &self.dependency_status,
        }
    }
}

impl Db {
    /// Connect to the configured endpoint. The Any engine picks the backend
    /// from the scheme, so tests can run against `mem://`.
    pub async fn connect(config: &DaemonConfig) -> Result<Self> {
        let inner = connect(&config.db_url)
            .await
            .with_context(|| format!("connecting to {}", config.db_url))?;
        inner
            .use_ns(&config.ns)
            .use_db(&config.db)
            .await
            .context("selecting surreal namespace/db")?;
        Ok(Self { inner })
    }

    pub async fn bootstrap_schema(&self) -> Result<()> {
        let schema = include_str!("../schema.surql");
        let _ = self.inner.query(schema).await.context("applying schema")?;
        Ok(())
    }

    // --- tasks ---

    pub async fn create_task(&self, task: &Task) -> Result<()> {
        let _: Option<Created> = self
            .inner
            .create(("task", task.id.as_str()))
            .content(json!({
                "project_id": task.project_id,
                "task_type": task.task_type,
                "status": task.status,
                "params": task.params,
                "dependant_on": task.dependant_on,
                "worker_id": task.worker_id,
                "created_at": task.created_at,
                "updated_at": task.updated_at,
                "generation_started_at": task.generation_started_at,
                "generation_processed_at": task.generation_processed_at,
                "output_location": task.output_location,
                "error_message": task.error_message,
            }))
            .await
            .with_context(|| format!("inserting task {}", task.id))?;
        Ok(())
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let mut res = self
            .inner
            .query(format!("SELECT {TASK_FIELDS} FROM type::thing('task', $id);"))
            .bind(("id", task_id.to_string()))
            .await?;
        let task: Option<Task> = res.take(0)?;
        Ok(task)
    }

    /// Candidate tasks for one eligibility pass, oldest first. `scope`
    /// restricts to the given project ids (user-token callers).
    pub async fn tasks_by_status(
        &self,
        statuses: &[TaskStatus],
        scope: Option<&[Id]>,
    ) -> Result<Vec<Task>> {
        let status_strings: Vec<String> =
            statuses.iter().map(|s| s.as_str().to_string()).collect();
        let mut q = format!("SELECT {TASK_FIELDS} FROM task WHERE status IN $statuses");
        if scope.is_some() {
            q.push_str(" AND project_id IN $projects");
        }
        q.push_str(" ORDER BY created_at ASC;");

        let mut query = self.inner.query(q).bind(("statuses", status_strings));
        if let Some(projects) = scope {
            query = query.bind(("projects", projects.to_vec()));
        }
        let mut res = query.await?;
        let tasks: Vec<Task> = res.take(0)?;
        Ok(tasks)
    }

    pub async fn non_terminal_tasks(&self) -> Result<Vec<Task>> {
        self.tasks_by_status(&[TaskStatus::Queued, TaskStatus::InProgress], None)
            .await
    }

    /// Attempt the atomic claim. A single conditional update guards both the
    /// `Queued` precondition and the per-user in-progress ceiling, so two
    /// racing claimers resolve to exactly one winner.
    pub async fn claim_task(
        &self,
        task_id: &str,
        worker_id: Option<&str>,
        owner_project_ids: &[Id],
    ) -> Result<bool> {
        let now = now_ms();
        let mut res = self
            .inner
            .query(
                "UPDATE type::thing('task', $id) SET \
                     status = 'In Progress', \
                     worker_id = $worker_id, \
                     generation_started_at = $now, \
                     updated_at = $now \
                 WHERE status = 'Queued' \
                   AND count(SELECT VALUE id FROM task \
                             WHERE status = 'In Progress' AND project_id IN $projects) < $ceiling \
                 RETURN AFTER;",
            )
            .bind(("id", task_id.to_string()))
            .bind(("worker_id", worker_id.map(|w| w.to_string())))
            .bind(("now", now))
            .bind(("projects", owner_project_ids.to_vec()))
            .bind(("ceiling", MAX_IN_PROGRESS_PER_USER as i64))
            .await?;
        let updated: Vec<Created> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Apply a status update. The write re-asserts the terminal-immutability
    /// guards so a racing update cannot slip past the handler's check.
    pub async fn update_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        output_location: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let mut sets = vec!["status = $status", "updated_at = $now"];
        if status == TaskStatus::Complete {
            sets.push("generation_processed_at = $now");
            if output_location.is_some() {
                sets.push("output_location = $output_location");
            }
        }
        if matches!(status, TaskStatus::Failed | TaskStatus::Cancelled)
            && error_message.is_some()
        {
            sets.push("error_message = $error_message");
        }

        let q = format!(
            "UPDATE type::thing('task', $id) SET {} \
             WHERE status != 'Cancelled' AND (status != 'Complete' OR $status = 'Complete') \
             RETURN AFTER;",
            sets.join(", ")
        );
        let mut res = self
            .inner
            .query(q)
            .bind(("id", task_id.to_string()))
            .bind(("status", status.as_str().to_string()))
            .bind(("now", now_ms()))
            .bind(("output_location", output_location.map(str::to_string)))
            .bind(("error_message", error_message.map(str::to_string)))
            .await?;
        let updated: Vec<Created> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    /// Cascade write: mark one related task terminal unless it already is.
    pub async fn cascade_mark(
        &self,
        task_id: &str,
        status: TaskStatus,
        error_message: &str,
    ) -> Result<bool> {
        let mut res = self
            .inner
            .query(
                "UPDATE type::thing('task', $id) SET \
                     status = $status, error_message = $error_message, updated_at = $now \
                 WHERE status IN ['Queued', 'In Progress'] \
                 RETURN AFTER;",
            )
            .bind(("id", task_id.to_string()))
            .bind(("status", status.as_str().to_string()))
            .bind(("error_message", error_message.to_string()))
            .bind(("now", now_ms()))
            .await?;
        let updated: Vec<Created> = res.take(0)?;
        Ok(!updated.is_empty())
    }

    pub async fn recent_tasks(
        &self,
        scope: Option<&[Id]>,
        status: Option<TaskStatus>,
        task_type: Option<&str>,
        created_after: Option<EpochMs>,
        limit: usize,
    ) -> Result<Vec<Task>> {
        let mut conditions: Vec<&str> = Vec::new();
        if scope.is_some() {
            conditions.push("project_id IN $projects");
        }
        if status.is_some() {
            conditions.push("status = $status");
        }
        if task_type.is_some() {
            conditions.push("task_type = $task_type");
        }
        if created_after.is_some() {
            conditions.push("created_at >= $cutoff");
        }
        let mut q = format!("SELECT {TASK_FIELDS} FROM task");
        if !conditions.is_empty() {
            q.push_str(" WHERE ");
            q.push_str(&conditions.join(" AND "));
        }
        q.push_str(" ORDER BY created_at DESC LIMIT $limit;");

        let mut query = self.inner.query(q).bind(("limit", limit as i64));
        if let Some(projects) = scope {
            query = query.bind(("projects", projects.to_vec()));
        }
        if let Some(status) = status {
            query = query.bind(("status", status.as_str().to_string()));
        }
        if let Some(task_type) = task_type {
            query = query.bind(("task_type", task_type.to_string()));
        }
        if let Some(cutoff) = created_after {
            query = query.bind(("cutoff", cutoff));
        }
        let mut res = query.await?;
        let tasks: Vec<Task> = res.take(0)?;
        Ok(tasks)
    }

    // --- snapshot assembly ---

    /// Load the candidate tasks plus every gating input the analyzer needs.
    pub async fn claim_snapshot(
        &self,
        scope: Option<&[Id]>,
        include_active: bool,
    ) -> Result<SnapshotData> {
        let statuses: &[TaskStatus] = if include_active {
            &[TaskStatus::Queued, TaskStatus::InProgress]
        } else {
            &[TaskStatus::Queued]
        };
        let tasks = self.tasks_by_status(statuses, scope).await?;

        // In-progress counts span *all* of a user's projects, not just the
        // caller's scope, so the owner lookup covers both sets.
        let in_progress_projects = self.in_progress_project_ids().await?;
        let mut project_ids: HashSet<Id> =
            tasks.iter().map(|t| t.project_id.clone()).collect();
        project_ids.extend(in_progress_projects.iter().cloned());

        let project_owners = self
            .project_owners(&project_ids.into_iter().collect::<Vec<_>>())
            .await?;

        let mut in_progress_per_user: HashMap<Id, usize> = HashMap::new();
        for project_id in &in_progress_projects {
            if let Some(owner) = project_owners.get(project_id) {
                *in_progress_per_user.entry(owner.clone()).or_default() += 1;
            }
        }

        let user_ids: Vec<Id> = project_owners
            .values()
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let users = self.users_by_ids(&user_ids).await?;
        let user_gates = users
            .into_iter()
            .map(|u| {
                let settings = u
                    .settings
                    .as_ref()
                    .map(ProcessingSettings::from_value)
                    .unwrap_or_default();
                let in_progress = in_progress_per_user.get(&u.id).copied().unwrap_or(0);
                (
                    u.id,
                    UserGate {
                        credits: u.credits,
                        settings,
                        in_progress,
                    },
                )
            })
            .collect();

        let dep_ids: Vec<Id> = tasks
            .iter()
            .filter_map(|t| t.dependant_on.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let dependency_status = self.task_statuses(&dep_ids).await?;

        Ok(SnapshotData {
            tasks,
            project_owners,
            user_gates,
            dependency_status,
        })
    }

    async fn in_progress_project_ids(&self) -> Result<Vec<Id>> {
        let mut res = self
            .inner
            .query("SELECT VALUE project_id FROM task WHERE status = 'In Progress';")
            .await?;
        let ids: Vec<Id> = res.take(0)?;
        Ok(ids)
    }

    async fn task_statuses(&self, task_ids: &[Id]) -> Result<HashMap<Id, TaskStatus>> {
        if task_ids.is_empty() {
            return Ok(HashMap::new());
        }
        #[derive(Deserialize)]
        struct Row {
            id: Id,
            status: TaskStatus,
        }
        let mut res = self
            .inner
            .query(
                "SELECT record::id(id) AS id, status FROM task WHERE record::id(id) IN $ids;",
            )
            .bind(("ids", task_ids.to_vec()))
            .await?;
        let rows: Vec<Row> = res.take(0)?;
        Ok(rows.into_iter().map(|r| (r.id, r.status)).collect())
    }

    // --- projects / users / tokens ---

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        let mut res = self
            .inner
            .query(
                "SELECT record::id(id) AS id, user_id, name, created_at \
                 FROM type::thing('project', $id);",
            )
            .bind(("id", project_id.to_string()))
            .await?;
        let project: Option<Project> = res.take(0)?;
        Ok(project)
    }

    pub async fn project_owners(&self, project_ids: &[Id]) -> Result<HashMap<Id, Id>> {
        if project_ids.is_empty() {
            return Ok(HashMap::new());
        }
        #[derive(Deserialize)]
        struct Row {
            id: Id,
            user_id: Id,
        }
        let mut res = self
            .inner
            .query(
                "SELECT record::id(id) AS id, user_id FROM project WHERE record::id(id) IN $ids;",
            )
            .bind(("ids", project_ids.to_vec()))
            .await?;
        let rows: Vec<Row> = res.take(0)?;
        Ok(rows.into_iter().map(|r| (r.id, r.user_id)).collect())
    }

    pub async fn user_project_ids(&self, user_id: &str) -> Result<Vec<Id>> {
        let mut res = self
            .inner
            .query("SELECT VALUE record::id(id) FROM project WHERE user_id = $user_id;")
            .bind(("user_id", user_id.to_string()))
            .await?;
        let ids: Vec<Id> = res.take(0)?;
        Ok(ids)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let mut res = self
            .inner
            .query(
                "SELECT record::id(id) AS id, credits, settings, created_at \
                 FROM type::thing('user', $id);",
            )
            .bind(("id", user_id.to_string()))
            .await?;
        let user: Option<User> = res.take(0)?;
        Ok(user)
    }

    async fn users_by_ids(&self, user_ids: &[Id]) -> Result<Vec<User>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut res = self
            .inner
            .query(
                "SELECT record::id(id) AS id, credits, settings, created_at \
                 FROM user WHERE record::id(id) IN $ids;",
            )
            .bind(("ids", user_ids.to_vec()))
            .await?;
        let users: Vec<User> = res.take(0)?;
        Ok(users)
    }

    pub async fn create_user(&self, user_id: &str, credits: f64, settings: Value) -> Result<()> {
        let _: Option<Created> = self
            .inner
            .create(("user", user_id))
            .content(json!({
                "credits": credits,
                "settings": settings,
                "created_at": now_ms(),
            }))
            .await
            .with_context(|| format!("inserting user {user_id}"))?;
        Ok(())
    }

    pub async fn create_project(
        &self,
        project_id: &str,
        user_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        let _: Option<Created> = self
            .inner
            .create(("project", project_id))
            .content(json!({
                "user_id": user_id,
                "name": name,
                "created_at": now_ms(),
            }))
            .await
            .with_context(|| format!("inserting project {project_id}"))?;
        Ok(())
    }

    pub async fn create_access_token(
        &self,
        token: &str,
        user_id: &str,
        label: Option<&str>,
    ) -> Result<()> {
        let _: Option<Created> = self
            .inner
            .create("access_token")
            .content(json!({
                "token": token,
                "user_id": user_id,
                "label": label,
                "created_at": now_ms(),
            }))
            .await
            .context("inserting access token")?;
        Ok(())
    }

    /// Verbatim personal-access-token lookup. A miss is the caller's 403.
    pub async fn token_user(&self, token: &str) -> Result<Option<Id>> {
        let mut res = self
            .inner
            .query("SELECT VALUE user_id FROM access_token WHERE token = $tok LIMIT 1;")
            .bind(("tok", token.to_string()))
            .await?;
        let mut ids: Vec<Id> = res.take(0)?;
        Ok(ids.pop())
    }
}
