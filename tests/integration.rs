//! Full scenario through the real HTTP surface: register a worker, create a
//! project and Build, poll for the dispatched Run, and push it through
//! Queued -> Running -> Passed the way a worker actually would, using
//! `tower::ServiceExt::oneshot` so no network bind is needed (§6.C).

mod common;

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use jobserv_core::artifact_store::ArtifactStore;
use jobserv_core::config::Config;
use jobserv_core::http::{router, AppState};
use jobserv_core::notify::{LoggingNotifier, Notifier};
use jobserv_core::store::Store;
use jobserv_core::vault::Vault;

async fn test_app(dir: &std::path::Path) -> AppState {
    let config_path = dir.join("jobserv.toml");
    let db_path = dir.join("jobserv.db");
    std::fs::write(
        &config_path,
        format!(
            r#"
            database_url = "sqlite://{db}?mode=rwc"
            artifact_root = "{artifacts}"
            worker_state_dir = "{state}"
            vault_key = "integration-test-key"
            "#,
            db = db_path.display(),
            artifacts = dir.join("artifacts").display(),
            state = dir.join("worker-state").display(),
        ),
    )
    .unwrap();
    let config = Arc::new(Config::load(&config_path).unwrap());

    let store = Store::connect(&config.database_url).await.unwrap();
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(jobserv_core::artifact_store::LocalArtifactStore::new(config.artifact_root.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(LoggingNotifier);
    let vault = Arc::new(Vault::new(&config.vault_key));

    AppState { store, artifacts, notifier, vault, config }
}

async fn body_json(resp: axum::response::Response) -> Value {
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn project_to_build_to_dispatch_to_pass_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_app(dir.path()).await;
    let app = router(state);

    // Register a worker that can run amd64 work.
    let req = Request::post("/workers")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "name": "w1",
                "distro": "debian",
                "mem_total": 8192,
                "cpu_total": 4,
                "cpu_type": "x86_64",
                "concurrent_runs": 2,
                "host_tags": "amd64",
                "api_key": "worker-secret",
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // A freshly registered worker isn't enlisted yet; enlist it.
    let req = Request::builder()
        .method("PUT")
        .uri("/workers/w1")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "enlisted": true }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Create the project.
    let req = Request::post("/projects")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "name": "widgets" }).to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);

    // Trigger a Build, which instantiates the "unit" Run.
    let req = Request::post("/projects/widgets/builds")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "trigger-name": "git_poller",
                "project-definition": common::MINIMAL_PROJECT,
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let build_body = body_json(resp).await;
    let build_id = build_body["data"]["build_id"].as_i64().unwrap();

    // The worker polls and is handed the Run's synthesized run-definition,
    // not a bare Run row.
    let req = Request::get("/workers/w1").body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let poll_body = body_json(resp).await;
    let run_name = poll_body["data"]["run"]["run"].as_str().unwrap().to_string();
    assert_eq!(run_name, "unit");
    assert_eq!(poll_body["data"]["run"]["container"], "alpine");
    assert!(poll_body["data"]["run"]["script"].as_str().is_some());
    let api_key = poll_body["data"]["run"]["api_key"].as_str().unwrap().to_string();

    // The worker reports Running, then Passed, using its per-Run api key.
    for status in ["RUNNING", "PASSED"] {
        let req = Request::post(format!(
            "/projects/widgets/builds/{build_id}/runs/{run_name}?apikey={api_key}"
        ))
        .header("x-run-status", status)
        .body(Body::empty())
        .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "status update to {status} failed");
    }

    let req = Request::get(format!("/projects/widgets/builds/{build_id}")).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let get_body = body_json(resp).await;
    assert_eq!(get_body["data"]["build"]["status"], "PASSED");
    assert_eq!(get_body["data"]["runs"][0]["status"], "PASSED");
}

#[tokio::test]
async fn run_update_with_wrong_api_key_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_app(dir.path()).await;
    let app = router(state);

    let req = Request::post("/projects")
        .header("content-type", "application/json")
        .body(Body::from(json!({ "name": "widgets" }).to_string()))
        .unwrap();
    app.clone().oneshot(req).await.unwrap();

    let req = Request::post("/projects/widgets/builds")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "trigger-name": "git_poller",
                "project-definition": common::MINIMAL_PROJECT,
            })
            .to_string(),
        ))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let build_body = body_json(resp).await;
    let build_id = build_body["data"]["build_id"].as_i64().unwrap();

    let req = Request::post(format!(
        "/projects/widgets/builds/{build_id}/runs/unit?apikey=not-the-real-key"
    ))
    .header("x-run-status", "RUNNING")
    .body(Body::empty())
    .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
