use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header::CONTENT_TYPE},
};
use http_body_util::BodyExt;
use parity_server::{
    repositories::{
        runner::SqliteRunnerRepository,
        sqlite::SqliteDb,
        task::SqliteTaskRepository,
    },
    routes::{AppState, Services, build_router},
    services::{
        settlement::DevWalletSettlement,
        task::{DefaultTaskService, TaskServiceArgs},
    },
    workers::{events::EventBus, webhook::WebhookRegistry},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

async fn make_app(minimum_stake: f64, dev_stake: f64) -> Router {
    let db = SqliteDb::connect("sqlite://:memory:").await.expect("failed to create db");
    let tasks = Arc::new(SqliteTaskRepository::new(db.clone()));
    let runners = Arc::new(SqliteRunnerRepository::new(db));
    let events = EventBus::new();
    let service = DefaultTaskService::new(TaskServiceArgs {
        tasks,
        runners: runners.clone(),
        settlement: Arc::new(DevWalletSettlement::new(dev_stake)),
        events: events.clone(),
        minimum_stake,
    });
    let state = AppState {
        services: Services { task: Arc::new(service) },
        runners,
        registry: Arc::new(WebhookRegistry::default()),
        artifacts: None,
        events,
    };
    build_router(state, "")
}

async fn send(app: &Router, method: &str, uri: &str, headers: &[(&str, &str)], body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = match body {
        Some(body) => builder
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let bytes = response.into_body().collect().await.expect("failed to read body").to_bytes();
    let body = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
    (status, body)
}

fn command_task() -> Value {
    json!({
        "title": "echo greeting",
        "description": "prints a greeting",
        "task_type": "command",
        "config": { "command": ["echo", "hello"] },
        "reward": 0.5,
    })
}

#[tokio::test]
async fn task_lifecycle_through_result() {
    let app = make_app(1.0, 100.0).await;

    let (status, _) = send(
        &app,
        "POST",
        "/runners",
        &[("X-Device-ID", "runner-1")],
        Some(json!({ "webhook": "http://10.0.0.1:8080" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, task) =
        send(&app, "POST", "/tasks", &[("X-Device-ID", "creator-1")], Some(command_task())).await;
    assert_eq!(status, StatusCode::CREATED, "{task}");
    assert_eq!(task["status"], "pending");
    let nonce = task["nonce"].as_str().expect("no nonce");
    assert_eq!(nonce.len(), 64);
    let task_id = task["id"].as_str().expect("no id").to_string();

    let (status, available) = send(&app, "GET", "/runners/tasks/available", &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(available.as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        "POST",
        &format!("/tasks/{task_id}/assign"),
        &[],
        Some(json!({ "runner_id": "runner-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, task) = send(&app, "GET", &format!("/tasks/{task_id}"), &[], None).await;
    assert_eq!(task["status"], "running");

    // A second assignment attempt loses on the Pending guard.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/tasks/{task_id}/assign"),
        &[],
        Some(json!({ "runner_id": "runner-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let result_body = json!({
        "output": format!("hello {nonce}"),
        "exit_code": 0,
        "cpu_seconds": 1.0,
        "memory_gb_hours": 0.01,
    });
    let (status, result) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/result"),
        &[("X-Device-ID", "runner-1")],
        Some(result_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{result}");
    assert_eq!(result["reward"], 0.0001);
    let result_id = result["id"].as_str().unwrap().to_string();

    let (_, task) = send(&app, "GET", &format!("/tasks/{task_id}"), &[], None).await;
    assert_eq!(task["status"], "completed");
    assert!(task["completed_at"].is_string());

    let (status, reward) = send(&app, "GET", &format!("/tasks/{task_id}/reward"), &[], None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reward, json!(0.0001));

    // Submitting the same result again changes nothing.
    let (status, duplicate) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/result"),
        &[("X-Device-ID", "runner-1")],
        Some(result_body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(duplicate["id"], result_id.as_str());

    let (_, available) = send(&app, "GET", "/runners/tasks/available", &[], None).await;
    assert!(available.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn tampered_output_is_rejected() {
    let app = make_app(1.0, 100.0).await;
    send(&app, "POST", "/runners", &[("X-Device-ID", "runner-1")], Some(json!({}))).await;
    let (_, task) = send(&app, "POST", "/tasks", &[("X-Device-ID", "creator-1")], Some(command_task())).await;
    let task_id = task["id"].as_str().unwrap().to_string();
    send(&app, "POST", &format!("/tasks/{task_id}/assign"), &[], Some(json!({ "runner_id": "runner-1" })))
        .await;

    let (status, error) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/result"),
        &[("X-Device-ID", "runner-1")],
        Some(json!({ "output": "hello", "exit_code": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error_code"], "NONCE_VERIFICATION_FAILED");

    let (_, task) = send(&app, "GET", &format!("/tasks/{task_id}"), &[], None).await;
    assert_eq!(task["status"], "not_verified");

    let (status, _) = send(&app, "GET", &format!("/tasks/{task_id}/result"), &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failing_exit_code_fails_the_task() {
    let app = make_app(1.0, 100.0).await;
    send(&app, "POST", "/runners", &[("X-Device-ID", "runner-1")], Some(json!({}))).await;
    let (_, task) = send(&app, "POST", "/tasks", &[("X-Device-ID", "creator-1")], Some(command_task())).await;
    let task_id = task["id"].as_str().unwrap().to_string();
    let nonce = task["nonce"].as_str().unwrap().to_string();
    send(&app, "POST", &format!("/tasks/{task_id}/assign"), &[], Some(json!({ "runner_id": "runner-1" })))
        .await;

    let (status, result) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/result"),
        &[("X-Device-ID", "runner-1")],
        Some(json!({ "output": format!("hello {nonce}"), "error": "boom", "exit_code": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["reward"], 0.0);

    let (_, task) = send(&app, "GET", &format!("/tasks/{task_id}"), &[], None).await;
    assert_eq!(task["status"], "failed");
}

#[tokio::test]
async fn unstaked_creators_are_refused() {
    let app = make_app(1.0, 0.0).await;
    let (status, error) =
        send(&app, "POST", "/tasks", &[("X-Device-ID", "creator-1")], Some(command_task())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error_code"], "INSUFFICIENT_STAKE");

    let (_, tasks) = send(&app, "GET", "/tasks", &[], None).await;
    assert!(tasks.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn identity_header_is_mandatory() {
    let app = make_app(1.0, 100.0).await;
    let (status, error) = send(&app, "POST", "/tasks", &[], Some(command_task())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error_code"], "MISSING_HEADER");
}

#[tokio::test]
async fn runner_start_and_complete_flow() {
    let app = make_app(1.0, 100.0).await;
    send(&app, "POST", "/runners", &[("X-Device-ID", "runner-1")], Some(json!({}))).await;
    let (_, task) = send(&app, "POST", "/tasks", &[("X-Device-ID", "creator-1")], Some(command_task())).await;
    let task_id = task["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/start"),
        &[("X-Runner-ID", "runner-1")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Starting again is a no-op.
    let (status, _) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/start"),
        &[("X-Runner-ID", "runner-1")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) =
        send(&app, "POST", &format!("/runners/tasks/{task_id}/complete"), &[], None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, task) = send(&app, "GET", &format!("/tasks/{task_id}"), &[], None).await;
    assert_eq!(task["status"], "completed");

    // Completed tasks refuse to restart.
    let (status, error) = send(
        &app,
        "POST",
        &format!("/runners/tasks/{task_id}/start"),
        &[("X-Runner-ID", "runner-1")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error_code"], "ALREADY_COMPLETED");
}

#[tokio::test]
async fn unknown_task_is_a_404() {
    let app = make_app(1.0, 100.0).await;
    let (status, error) =
        send(&app, "GET", "/tasks/00000000-0000-0000-0000-000000000000", &[], None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error_code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn webhook_registration_round_trip() {
    let app = make_app(1.0, 100.0).await;
    send(&app, "POST", "/runners", &[("X-Device-ID", "runner-1")], Some(json!({}))).await;

    let (status, registration) = send(
        &app,
        "POST",
        "/runners/webhooks",
        &[("X-Device-ID", "runner-1")],
        Some(json!({ "url": "http://10.0.0.1:8080/hooks" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(registration["id"].is_string());

    let (status, _) = send(&app, "DELETE", "/runners/webhooks", &[("X-Device-ID", "runner-1")], None).await;
    assert_eq!(status, StatusCode::OK);
}
