//! End-to-end tests for the queue daemon, run against the in-memory engine
//! through the real router.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use dispatch_daemon::api::{self, AppState};
use dispatch_daemon::config::DaemonConfig;
use dispatch_daemon::db::Db;
use serde_json::{json, Value};
use tower::ServiceExt;

const SERVICE_SECRET: &str = "test-service-secret";

async fn test_state() -> AppState {
    let config = DaemonConfig {
        listen: "127.0.0.1:0".into(),
        db_url: "mem://".into(),
        ns: "dispatch".into(),
        db: "test".into(),
        service_role_secret: SERVICE_SECRET.into(),
        jwt_secret: None,
    };
    let db = Db::connect(&config).await.expect("connect mem://");
    db.bootstrap_schema().await.expect("bootstrap schema");
    AppState::new(db, config)
}

async fn call(app: &Router, token: Option<&str>, path: &str, body: Value) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let req = builder.body(Body::from(body.to_string())).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn svc(app: &Router, path: &str, body: Value) -> (StatusCode, Value) {
    call(app, Some(SERVICE_SECRET), path, body).await
}

/// Provision a user with a project and a personal access token through the
/// admin surface. Returns (user_id, project_id, token).
async fn seed_user(app: &Router, credits: f64, settings: Value) -> (String, String, String) {
    let mut body = json!({ "credits": credits });
    if let Value::Object(map) = settings {
        for (k, v) in map {
            body[k] = v;
        }
    }
    let (status, user) = svc(app, "/v1/admin/users", body).await;
    assert_eq!(status, StatusCode::OK);
    let user_id = user["user_id"].as_str().unwrap().to_string();

    let (status, project) = svc(app, "/v1/admin/projects", json!({ "user_id": user_id })).await;
    assert_eq!(status, StatusCode::OK);
    let project_id = project["project_id"].as_str().unwrap().to_string();

    let (status, token) = svc(app, "/v1/admin/tokens", json!({ "user_id": user_id })).await;
    assert_eq!(status, StatusCode::OK);
    let token = token["token"].as_str().unwrap().to_string();

    (user_id, project_id, token)
}

async fn create_task(app: &Router, project_id: &str, task_type: &str, params: Value) -> String {
    let (status, body) = svc(
        app,
        "/v1/tasks/create",
        json!({ "task_type": task_type, "params": params, "project_id": project_id }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
    assert_eq!(body["status"], "Task queued");
    body["task_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn round_trip_create_claim_complete_output() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;

    let task_id = create_task(&app, &project_id, "x", json!({"a": 1})).await;

    let (status, claimed) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["task_id"], task_id.as_str());
    assert_eq!(claimed["task_type"], "x");
    assert_eq!(claimed["params"]["a"], 1);
    assert_eq!(claimed["project_id"], project_id.as_str());

    let row = state.db.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status.as_str(), "In Progress");
    assert!(row.worker_id.is_some(), "cloud claim records worker_id");
    assert!(row.generation_started_at.is_some());

    let (status, updated) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": task_id, "status": "Complete", "output_location": "u" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["success"], true);

    let (status, output) = svc(&app, "/v1/tasks/output", json!({ "task_id": task_id })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output["status"], "Complete");
    assert_eq!(output["output_location"], "u");
}

#[tokio::test]
async fn claim_empty_pool_returns_no_content() {
    let state = test_state().await;
    let app = api::router(state);
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn dry_run_counts_without_claiming() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    create_task(&app, &project_id, "x", json!({})).await;
    create_task(&app, &project_id, "x", json!({})).await;

    let (status, body) = svc(&app, "/v1/tasks/claim", json!({ "dry_run": true })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available_tasks"], 2);

    // Nothing moved to In Progress.
    let (status, body) = svc(&app, "/v1/tasks/claim", json!({ "dry_run": true })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available_tasks"], 2);
}

#[tokio::test]
async fn fifo_claims_oldest_first_and_run_type_filters() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    // Fixed ids keep the FIFO tie-break deterministic when both creates land
    // on the same millisecond.
    let older = "task-a-older".to_string();
    let newer = "task-b-newer".to_string();
    for (id, task_type) in [(&older, "travel_segment"), (&newer, "single_image")] {
        let (status, _) = svc(
            &app,
            "/v1/tasks/create",
            json!({ "task_type": task_type, "params": {}, "project_id": project_id, "task_id": id }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // run_type narrows the pool past the older task.
    let (status, body) = svc(
        &app,
        "/v1/tasks/claim",
        json!({ "run_type": "single_image" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], newer.as_str());

    let (status, body) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], older.as_str());
}

#[tokio::test]
async fn complete_task_cannot_be_failed() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    let task_id = create_task(&app, &project_id, "x", json!({})).await;

    svc(&app, "/v1/tasks/claim", json!({})).await;
    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": task_id, "status": "Complete", "output_location": "u" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": task_id, "status": "Failed" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "got: {body}");

    let row = state.db.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(row.status.as_str(), "Complete");
}

#[tokio::test]
async fn cancelled_task_rejects_all_updates() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    let task_id = create_task(&app, &project_id, "x", json!({})).await;

    // Pre-claim cancellation is a legal edge.
    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": task_id, "status": "Cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    for next in ["Complete", "Failed", "Cancelled"] {
        let (status, _) = svc(
            &app,
            "/v1/tasks/status",
            json!({ "task_id": task_id, "status": next }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "update to {next} must be rejected");
    }

    // A cancelled task is no longer claimable either.
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn dependency_gates_until_complete() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    let first = create_task(&app, &project_id, "x", json!({})).await;
    let (status, body) = svc(
        &app,
        "/v1/tasks/create",
        json!({
            "task_type": "x",
            "params": {},
            "project_id": project_id,
            "dependant_on": first,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let second = body["task_id"].as_str().unwrap().to_string();

    // First claim takes the dependency; the dependant stays gated while the
    // dependency is In Progress.
    let (status, body) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], first.as_str());
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": first, "status": "Complete", "output_location": "a" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], second.as_str());
}

#[tokio::test]
async fn orchestrator_is_never_claimable() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    let orchestrator = create_task(
        &app,
        &project_id,
        "travel_orchestrator",
        json!({"orchestrator_details": {"run_id": "r1"}}),
    )
    .await;
    let (status, body) = svc(
        &app,
        "/v1/tasks/create",
        json!({
            "task_type": "travel_segment",
            "params": {"orchestrator_task_id": orchestrator},
            "project_id": project_id,
            "dependant_on": orchestrator,
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let segment = body["task_id"].as_str().unwrap().to_string();

    // Neither the orchestrator (excluded) nor the segment (gated) claims.
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Orchestrators are completed by the creation path, not by workers.
    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": orchestrator, "status": "Complete" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], segment.as_str());
}

#[tokio::test]
async fn zero_credit_user_excluded_from_cloud_but_not_local() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, token) = seed_user(&app, 0.0, json!({})).await;
    create_task(&app, &project_id, "x", json!({})).await;

    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT, "cloud pool honors credits");

    let (status, body) = call(&app, Some(&token), "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK, "local pool bypasses credits: {body}");
}

#[tokio::test]
async fn processing_preferences_gate_pools_independently() {
    let state = test_state().await;
    let app = api::router(state.clone());

    // Cloud disabled: service-role pass skips, owner's local pass claims.
    let (_, project_a, token_a) =
        seed_user(&app, 10.0, json!({"allow_cloud_processing": false})).await;
    create_task(&app, &project_a, "x", json!({})).await;
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, Some(&token_a), "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);

    // Local disabled: owner cannot claim their own task, the cloud can.
    let (_, project_b, token_b) =
        seed_user(&app, 10.0, json!({"allow_local_processing": false})).await;
    create_task(&app, &project_b, "x", json!({})).await;
    let (status, _) = call(&app, Some(&token_b), "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn per_user_ceiling_holds_across_repeated_claims() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (user_id, project_id, _) = seed_user(&app, 100.0, json!({})).await;
    for _ in 0..7 {
        create_task(&app, &project_id, "x", json!({})).await;
    }

    let mut claimed = 0;
    loop {
        let (status, _) = svc(&app, "/v1/tasks/claim", json!({})).await;
        if status != StatusCode::OK {
            assert_eq!(status, StatusCode::NO_CONTENT);
            break;
        }
        claimed += 1;
        assert!(claimed <= 5, "claimed past the per-user ceiling");
    }
    assert_eq!(claimed, 5);

    let in_progress = state
        .db
        .tasks_by_status(&[dispatch_core::model::TaskStatus::InProgress], None)
        .await
        .unwrap();
    assert_eq!(in_progress.len(), 5, "user {user_id} exceeded the ceiling");
}

#[tokio::test]
async fn cascade_fails_group_but_leaves_complete_sibling() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;

    let orchestrator = create_task(
        &app,
        &project_id,
        "travel_orchestrator",
        json!({"orchestrator_details": {"run_id": "r1"}}),
    )
    .await;
    let child = |n: u32| {
        json!({
            "task_type": "travel_segment",
            "params": {"orchestrator_task_id": orchestrator, "segment_index": n},
            "project_id": project_id,
        })
    };
    let (_, c1) = svc(&app, "/v1/tasks/create", child(1)).await;
    let (_, c2) = svc(&app, "/v1/tasks/create", child(2)).await;
    let (_, c3) = svc(&app, "/v1/tasks/create", child(3)).await;
    let c1 = c1["task_id"].as_str().unwrap().to_string();
    let c2 = c2["task_id"].as_str().unwrap().to_string();
    let c3 = c3["task_id"].as_str().unwrap().to_string();

    // C1 finishes before the failure.
    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": c1, "status": "Complete", "output_location": "seg1.mp4" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": c2, "status": "Failed", "error_message": "oom" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let o = state.db.get_task(&orchestrator).await.unwrap().unwrap();
    let s1 = state.db.get_task(&c1).await.unwrap().unwrap();
    let s3 = state.db.get_task(&c3).await.unwrap().unwrap();
    assert_eq!(o.status.as_str(), "Failed");
    assert!(o.error_message.as_deref().unwrap_or("").contains(&c2));
    assert_eq!(s3.status.as_str(), "Failed");
    assert!(s3.error_message.is_some());
    assert_eq!(s1.status.as_str(), "Complete", "complete sibling untouched");
    assert!(s1.error_message.is_none());
}

#[tokio::test]
async fn cascade_from_root_cancellation_reaches_children() {
    let state = test_state().await;
    let app = api::router(state.clone());
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;

    let orchestrator = create_task(
        &app,
        &project_id,
        "join_clips_orchestrator",
        json!({"orchestrator_details": {"run_id": "r2"}}),
    )
    .await;
    let (_, child) = svc(
        &app,
        "/v1/tasks/create",
        json!({
            "task_type": "join_clips_segment",
            "params": {"orchestrator_details": {"orchestrator_task_id": orchestrator}},
            "project_id": project_id,
        }),
    )
    .await;
    let child = child["task_id"].as_str().unwrap().to_string();

    let (status, _) = svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": orchestrator, "status": "Cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let c = state.db.get_task(&child).await.unwrap().unwrap();
    assert_eq!(c.status.as_str(), "Cancelled");
    assert!(c.error_message.as_deref().unwrap_or("").contains(&orchestrator));
}

#[tokio::test]
async fn concurrent_claims_have_exactly_one_winner() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    create_task(&app, &project_id, "x", json!({})).await;

    let (a, b, c, d, e) = tokio::join!(
        svc(&app, "/v1/tasks/claim", json!({})),
        svc(&app, "/v1/tasks/claim", json!({})),
        svc(&app, "/v1/tasks/claim", json!({})),
        svc(&app, "/v1/tasks/claim", json!({})),
        svc(&app, "/v1/tasks/claim", json!({})),
    );
    let statuses = [a.0, b.0, c.0, d.0, e.0];
    let winners = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let losers = statuses
        .iter()
        .filter(|s| **s == StatusCode::NO_CONTENT)
        .count();
    assert_eq!(winners, 1, "statuses: {statuses:?}");
    assert_eq!(losers, 4);
}

#[tokio::test]
async fn user_scope_is_enforced() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_a, token_a) = seed_user(&app, 10.0, json!({})).await;
    let (_, project_b, _) = seed_user(&app, 10.0, json!({})).await;
    let foreign_task = create_task(&app, &project_b, "x", json!({})).await;

    // A's pool contains no tasks even though B has one queued.
    let (status, _) = call(&app, Some(&token_a), "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        Some(&token_a),
        "/v1/tasks/output",
        json!({ "task_id": foreign_task }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Some(&token_a),
        "/v1/tasks/status",
        json!({ "task_id": foreign_task, "status": "Cancelled" }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        Some(&token_a),
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {}, "project_id": project_b }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Own-project creation works.
    let (status, _) = call(
        &app,
        Some(&token_a),
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {}, "project_id": project_a }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn auth_failures_map_to_401_and_403() {
    let state = test_state().await;
    let app = api::router(state);

    let (status, _) = call(&app, None, "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Some("not-a-real-token"), "/v1/tasks/claim", json!({})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, _, token) = seed_user(&app, 10.0, json!({})).await;
    let (status, _) = call(
        &app,
        Some(&token),
        "/v1/admin/users",
        json!({ "credits": 1.0 }),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN, "admin surface is service-only");
}

#[tokio::test]
async fn create_validations() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;

    let (status, _) = svc(
        &app,
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {} }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "project_id is required");

    let (status, _) = svc(
        &app,
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {}, "project_id": "ghost" }),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Caller-supplied ids are honored and must be unique.
    let (status, body) = svc(
        &app,
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {}, "project_id": project_id, "task_id": "chosen-id" }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["task_id"], "chosen-id");

    let (status, _) = svc(
        &app,
        "/v1/tasks/create",
        json!({ "task_type": "x", "params": {}, "project_id": project_id, "task_id": "chosen-id" }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn explain_reports_exclusion_reasons() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 0.0, json!({})).await;
    create_task(&app, &project_id, "x", json!({})).await;

    let (status, body) = svc(&app, "/v1/tasks/explain", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available_tasks"], 0);
    assert_eq!(body["excluded"][0]["reason"], "no_credits");
}

#[tokio::test]
async fn recent_summary_aggregates() {
    let state = test_state().await;
    let app = api::router(state);
    let (_, project_id, _) = seed_user(&app, 10.0, json!({})).await;
    let done = create_task(&app, &project_id, "x", json!({})).await;
    create_task(&app, &project_id, "y", json!({})).await;

    svc(&app, "/v1/tasks/claim", json!({})).await;
    svc(
        &app,
        "/v1/tasks/status",
        json!({ "task_id": done, "status": "Complete", "output_location": "u" }),
    )
    .await;

    let (status, body) = svc(&app, "/v1/tasks/recent", json!({})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["status_distribution"]["Complete"], 1);
    assert_eq!(body["status_distribution"]["Queued"], 1);
    assert_eq!(body["timing"]["samples"], 1);
}
