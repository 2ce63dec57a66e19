use crate::auth::{Authenticator, Caller};
use crate::cascade;
use crate::config::DaemonConfig;
use crate::db::Db;
use crate::reqlog::RequestLog;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dispatch_core::api::{
    ClaimRequest, ClaimResponse, CountResponse, CreateProjectRequest, CreateProjectResponse,
    CreateTaskRequest, CreateTaskResponse, CreateTokenRequest, CreateTokenResponse,
    CreateUserRequest, CreateUserResponse, ExcludedTask, ExplainRequest, ExplainResponse,
    RecentTasksRequest, RecentTasksResponse, TaskErrorSummary, TaskOutputRequest,
    TaskOutputResponse, TimingStats, UpdateStatusRequest, UpdateStatusResponse,
};
use dispatch_core::eligibility::{analyze, Pool};
use dispatch_core::model::{Id, Task, TaskStatus};
use dispatch_core::{new_task_id, now_ms};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 500;
const RECENT_ERRORS_SHOWN: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub auth: Authenticator,
    pub config: DaemonConfig,
}

impl AppState {
    pub fn new(db: Db, config: DaemonConfig) -> Self {
        let auth = Authenticator::new(&config);
        Self { db, auth, config }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, msg) = match self {
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (code, Json(serde_json::json!({ "error": msg }))).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/tasks/claim", post(claim_task))
        .route("/v1/tasks/create", post(create_task))
        .route("/v1/tasks/status", post(update_status))
        .route("/v1/tasks/output", post(task_output))
        .route("/v1/tasks/explain", post(explain))
        .route("/v1/tasks/recent", post(recent_tasks))
        .route("/v1/admin/users", post(admin_create_user))
        .route("/v1/admin/projects", post(admin_create_project))
        .route("/v1/admin/tokens", post(admin_create_token))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn finish<T>(rlog: RequestLog, res: Result<T, ApiError>) -> Result<T, ApiError> {
    match &res {
        Ok(_) => rlog.flush("ok"),
        Err(e) => rlog.flush(&format!("error: {e}")),
    }
    res
}

/// Caller scope for eligibility: service role draws from the global cloud
/// pool; a user draws the local pool of their own projects.
async fn scope_for(
    state: &AppState,
    caller: &Caller,
) -> Result<(Option<Vec<Id>>, Pool), ApiError> {
    match caller {
        Caller::ServiceRole => Ok((None, Pool::Cloud)),
        Caller::User(user_id) => {
            let projects = state
                .db
                .user_project_ids(user_id)
                .await
                .map_err(ApiError::internal)?;
            Ok((Some(projects), Pool::Local))
        }
    }
}

async fn authorize_task(
    state: &AppState,
    caller: &Caller,
    task: &Task,
) -> Result<(), ApiError> {
    let Caller::User(user_id) = caller else {
        return Ok(());
    };
    let project = state
        .db
        .get_project(&task.project_id)
        .await
        .map_err(ApiError::internal)?;
    match project {
        Some(p) if p.user_id == *user_id => Ok(()),
        _ => Err(ApiError::Forbidden(
            "task is not in a project owned by the caller".into(),
        )),
    }
}

fn require_service(caller: &Caller) -> Result<(), ApiError> {
    if caller.is_service() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("service role required".into()))
    }
}

// --- claim ---

pub async fn claim_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ClaimRequest>,
) -> Result<Response, ApiError> {
    let mut rlog = RequestLog::new("claim");
    let res = claim_inner(&state, &headers, req, &mut rlog).await;
    finish(rlog, res)
}

async fn claim_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: ClaimRequest,
    rlog: &mut RequestLog,
) -> Result<Response, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;
    let (scope, pool) = scope_for(state, &caller).await?;

    // In-progress candidates only matter for counting/diagnostics.
    let include_active = req.dry_run && req.include_active;
    let snapshot = state
        .db
        .claim_snapshot(scope.as_deref(), include_active)
        .await
        .map_err(ApiError::internal)?;
    let analysis = analyze(&snapshot.as_refs(), pool, req.run_type.as_deref());
    rlog.push(format!(
        "{} candidates, {} eligible",
        snapshot.tasks.len(),
        analysis.eligible.len()
    ));

    if req.dry_run {
        return Ok(Json(CountResponse {
            available_tasks: analysis.eligible.len(),
        })
        .into_response());
    }

    let Some(head) = analysis.eligible.first() else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };

    // Worker identity is recorded for cloud claims only.
    let worker_id = match &caller {
        Caller::ServiceRole => Some(
            req.worker_id
                .clone()
                .unwrap_or_else(|| format!("cloud-{}", uuid::Uuid::new_v4())),
        ),
        Caller::User(_) => None,
    };

    let owner = snapshot
        .project_owners
        .get(&head.project_id)
        .cloned()
        .ok_or_else(|| ApiError::internal("eligible task has no resolved owner"))?;
    let owner_projects = state
        .db
        .user_project_ids(&owner)
        .await
        .map_err(ApiError::internal)?;

    let claimed = state
        .db
        .claim_task(&head.id, worker_id.as_deref(), &owner_projects)
        .await
        .map_err(ApiError::internal)?;
    if !claimed {
        // Another claimer won the race; the caller retries.
        rlog.push(format!("lost claim race for task {}", head.id));
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    rlog.push(format!("claimed task {}", head.id));
    Ok(Json(ClaimResponse {
        task_id: head.id.clone(),
        params: head.params.clone(),
        task_type: head.task_type.clone(),
        project_id: head.project_id.clone(),
    })
    .into_response())
}

// --- create ---

pub async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTaskRequest>,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let mut rlog = RequestLog::new("create");
    let res = create_inner(&state, &headers, req, &mut rlog).await;
    finish(rlog, res)
}

async fn create_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: CreateTaskRequest,
    rlog: &mut RequestLog,
) -> Result<Json<CreateTaskResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;

    if req.task_type.trim().is_empty() {
        return Err(ApiError::BadRequest("task_type is required".into()));
    }
    let project_id = req
        .project_id
        .ok_or_else(|| ApiError::BadRequest("project_id is required".into()))?;

    let project = state
        .db
        .get_project(&project_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("project not found".into()))?;
    if let Caller::User(user_id) = &caller {
        if project.user_id != *user_id {
            return Err(ApiError::Forbidden(
                "project is not owned by the caller".into(),
            ));
        }
    }

    let task_id = req.task_id.unwrap_or_else(new_task_id);
    if state
        .db
        .get_task(&task_id)
        .await
        .map_err(ApiError::internal)?
        .is_some()
    {
        return Err(ApiError::BadRequest(format!(
            "task {task_id} already exists"
        )));
    }

    let now = now_ms();
    let task = Task {
        id: task_id.clone(),
        project_id,
        task_type: req.task_type,
        status: TaskStatus::Queued,
        params: req.params,
        dependant_on: req.dependant_on,
        worker_id: None,
        created_at: now,
        updated_at: now,
        generation_started_at: None,
        generation_processed_at: None,
        output_location: None,
        error_message: None,
    };
    state
        .db
        .create_task(&task)
        .await
        .map_err(ApiError::internal)?;

    rlog.push(format!("queued task {task_id} ({})", task.task_type));
    Ok(Json(CreateTaskResponse {
        task_id,
        status: "Task queued".into(),
    }))
}

// --- status update + cascade ---

pub async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<UpdateStatusResponse>, ApiError> {
    let mut rlog = RequestLog::new("status");
    let res = update_status_inner(&state, &headers, req, &mut rlog).await;
    finish(rlog, res)
}

async fn update_status_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: UpdateStatusRequest,
    rlog: &mut RequestLog,
) -> Result<Json<UpdateStatusResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;

    if !req.status.is_terminal() {
        return Err(ApiError::BadRequest(
            "status must be Complete, Failed or Cancelled".into(),
        ));
    }

    let task = state
        .db
        .get_task(&req.task_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    authorize_task(state, &caller, &task).await?;

    task.status
        .accepts(req.status)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let applied = state
        .db
        .update_task_status(
            &req.task_id,
            req.status,
            req.output_location.as_deref(),
            req.error_message.as_deref(),
        )
        .await
        .map_err(ApiError::internal)?;
    if !applied {
        // The row moved under us between the read and the guarded write.
        return Err(ApiError::BadRequest(
            "task is no longer updatable".into(),
        ));
    }
    rlog.push(format!("task {} -> {}", req.task_id, req.status));

    if matches!(req.status, TaskStatus::Failed | TaskStatus::Cancelled) {
        let marked = cascade::propagate(&state.db, rlog, &task, req.status).await;
        if marked > 0 {
            rlog.push(format!("cascaded to {marked} related tasks"));
        }
    }

    Ok(Json(UpdateStatusResponse {
        success: true,
        task_id: req.task_id,
        status: req.status,
    }))
}

// --- output ---

pub async fn task_output(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TaskOutputRequest>,
) -> Result<Json<TaskOutputResponse>, ApiError> {
    let rlog = RequestLog::new("output");
    let res = task_output_inner(&state, &headers, req).await;
    finish(rlog, res)
}

async fn task_output_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: TaskOutputRequest,
) -> Result<Json<TaskOutputResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;
    let task = state
        .db
        .get_task(&req.task_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::NotFound("task not found".into()))?;
    authorize_task(state, &caller, &task).await?;

    Ok(Json(TaskOutputResponse {
        status: task.status,
        output_location: task.output_location,
        params: task.params,
        dependant_on: task.dependant_on,
    }))
}

// --- diagnostics ---

pub async fn explain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ExplainRequest>,
) -> Result<Json<ExplainResponse>, ApiError> {
    let rlog = RequestLog::new("explain");
    let res = explain_inner(&state, &headers, req).await;
    finish(rlog, res)
}

async fn explain_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: ExplainRequest,
) -> Result<Json<ExplainResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;
    let (scope, pool) = scope_for(state, &caller).await?;
    let snapshot = state
        .db
        .claim_snapshot(scope.as_deref(), req.include_active)
        .await
        .map_err(ApiError::internal)?;
    let analysis = analyze(&snapshot.as_refs(), pool, req.run_type.as_deref());

    Ok(Json(ExplainResponse {
        available_tasks: analysis.eligible.len(),
        eligible_task_ids: analysis.eligible.iter().map(|t| t.id.clone()).collect(),
        excluded: analysis
            .excluded
            .into_iter()
            .map(|(task, reason)| ExcludedTask {
                task_id: task.id,
                task_type: task.task_type,
                reason,
            })
            .collect(),
    }))
}

pub async fn recent_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RecentTasksRequest>,
) -> Result<Json<RecentTasksResponse>, ApiError> {
    let rlog = RequestLog::new("recent");
    let res = recent_inner(&state, &headers, req).await;
    finish(rlog, res)
}

async fn recent_inner(
    state: &AppState,
    headers: &HeaderMap,
    req: RecentTasksRequest,
) -> Result<Json<RecentTasksResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, headers).await?;
    let (scope, _) = scope_for(state, &caller).await?;

    let limit = req
        .limit
        .unwrap_or(DEFAULT_RECENT_LIMIT)
        .min(MAX_RECENT_LIMIT);
    let cutoff = req.hours.map(|h| now_ms() - i64::from(h) * 3_600_000);
    let tasks = state
        .db
        .recent_tasks(
            scope.as_deref(),
            req.status,
            req.task_type.as_deref(),
            cutoff,
            limit,
        )
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(summarize(&tasks)))
}

fn summarize(tasks: &[Task]) -> RecentTasksResponse {
    let mut status_distribution = BTreeMap::new();
    let mut task_type_distribution = BTreeMap::new();
    let mut worker_distribution = BTreeMap::new();
    let mut queue_ms: Vec<i64> = Vec::new();
    let mut processing_ms: Vec<i64> = Vec::new();

    for task in tasks {
        *status_distribution
            .entry(task.status.as_str().to_string())
            .or_insert(0) += 1;
        *task_type_distribution
            .entry(task.task_type.clone())
            .or_insert(0) += 1;
        if let Some(worker) = &task.worker_id {
            *worker_distribution.entry(worker.clone()).or_insert(0) += 1;
        }
        if let Some(started) = task.generation_started_at {
            queue_ms.push(started - task.created_at);
            if let Some(processed) = task.generation_processed_at {
                processing_ms.push(processed - started);
            }
        }
    }

    let avg_seconds = |samples: &[i64]| {
        if samples.is_empty() {
            None
        } else {
            Some(samples.iter().sum::<i64>() as f64 / samples.len() as f64 / 1000.0)
        }
    };

    let recent_errors = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .take(RECENT_ERRORS_SHOWN)
        .map(|t| TaskErrorSummary {
            task_id: t.id.clone(),
            task_type: t.task_type.clone(),
            error_message: t.error_message.clone(),
            created_at: t.created_at,
        })
        .collect();

    RecentTasksResponse {
        total_count: tasks.len(),
        status_distribution,
        task_type_distribution,
        worker_distribution,
        timing: TimingStats {
            avg_queue_seconds: avg_seconds(&queue_ms),
            avg_processing_seconds: avg_seconds(&processing_ms),
            samples: processing_ms.len(),
        },
        recent_errors,
    }
}

// --- admin provisioning (service role only) ---

pub async fn admin_create_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> Result<Json<CreateUserResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, &headers).await?;
    require_service(&caller)?;

    let user_id = req.user_id.unwrap_or_else(new_task_id);
    let mut settings = serde_json::Map::new();
    if let Some(allow) = req.allow_local_processing {
        settings.insert("allow_local_processing".into(), Value::Bool(allow));
    }
    if let Some(allow) = req.allow_cloud_processing {
        settings.insert("allow_cloud_processing".into(), Value::Bool(allow));
    }
    state
        .db
        .create_user(&user_id, req.credits, Value::Object(settings))
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(CreateUserResponse { user_id }))
}

pub async fn admin_create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<CreateProjectResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, &headers).await?;
    require_service(&caller)?;

    if state
        .db
        .get_user(&req.user_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::NotFound("user not found".into()));
    }
    let project_id = req.project_id.unwrap_or_else(new_task_id);
    state
        .db
        .create_project(&project_id, &req.user_id, req.name.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(CreateProjectResponse { project_id }))
}

pub async fn admin_create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateTokenRequest>,
) -> Result<Json<CreateTokenResponse>, ApiError> {
    let caller = state.auth.resolve(&state.db, &headers).await?;
    require_service(&caller)?;

    if state
        .db
        .get_user(&req.user_id)
        .await
        .map_err(ApiError::internal)?
        .is_none()
    {
        return Err(ApiError::NotFound("user not found".into()));
    }
    let token = format!("pat_{}", uuid::Uuid::new_v4().simple());
    state
        .db
        .create_access_token(&token, &req.user_id, req.label.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(CreateTokenResponse { token }))
}
