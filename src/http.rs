//! A thin axum surface exercising the core (§6.C): illustrative, not a full
//! REST implementation. Grounded on `jobserv/api/run.py`'s header-driven
//! run-update endpoint (`X-RUN-STATUS`/`X-RUN-METADATA`/`X-URL-EXPIRATION`)
//! and the JSend envelope convention used throughout the original API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::aggregator::{process_run_status_change, WebhookPolicy};
use crate::artifact_store::{console_path, rundef_path, ArtifactStore};
use crate::config::Config;
use crate::dispatcher::{status_counts, Dispatcher};
use crate::error::{JobservError, Result};
use crate::ingress::{authenticate, Ingress};
use crate::notify::Notifier;
use crate::pipeline::rundef::{redact_for_unauthenticated, RunContext};
use crate::pipeline::ProjectDefinition;
use crate::status::Status;
use crate::store::models::Run;
use crate::store::Store;
use crate::surge::SurgeMonitor;
use crate::trigger_engine::TriggerEngine;
use crate::vault::Vault;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub notifier: Arc<dyn Notifier>,
    pub vault: Arc<Vault>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/projects", get(list_projects).post(create_project))
        .route("/projects/:project", get(get_project).delete(delete_project))
        .route("/projects/:project/builds", get(list_builds).post(create_build))
        .route("/projects/:project/builds/:build_id", get(get_build))
        .route(
            "/projects/:project/builds/:build_id/project.yml",
            get(get_project_yml),
        )
        .route(
            "/projects/:project/builds/:build_id/runs/:run",
            get(get_run).post(run_update),
        )
        .route(
            "/projects/:project/builds/:build_id/runs/:run/cancel",
            post(cancel_run),
        )
        .route(
            "/projects/:project/builds/:build_id/runs/:run/create_signed",
            post(create_signed_urls),
        )
        .route(
            "/projects/:project/builds/:build_id/runs/:run/*rel",
            get(get_artifact),
        )
        .route("/workers", post(register_worker))
        .route("/workers/:name", get(poll_worker).put(update_worker))
        .route("/health/runs", get(health_runs))
        .with_state(state)
}

fn ok(data: Value) -> Json<Value> {
    Json(json!({ "status": "success", "data": data }))
}

#[derive(Deserialize)]
struct PageParams {
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    page: i64,
}
fn default_limit() -> i64 {
    25
}

fn page_envelope(items: Value, total: i64, limit: i64, page: i64, path: &str) -> Value {
    let pages = if limit > 0 { (total + limit - 1) / limit } else { 0 };
    let mut body = json!({ "data": items, "total": total, "pages": pages });
    if page + 1 < pages {
        body["next"] = json!(format!("{path}?limit={limit}&page={}", page + 1));
    }
    body
}

// ---- Projects -----------------------------------------------------------

async fn list_projects(
    State(state): State<AppState>,
    Query(p): Query<PageParams>,
) -> Result<impl IntoResponse> {
    let (projects, total) = state.store.list_projects(p.limit, p.limit * p.page).await?;
    Ok(ok(page_envelope(json!(projects), total, p.limit, p.page, "/projects")))
}

#[derive(Deserialize)]
struct CreateProject {
    name: String,
    #[serde(default)]
    synchronous_builds: bool,
}

async fn create_project(
    State(state): State<AppState>,
    Json(body): Json<CreateProject>,
) -> Result<impl IntoResponse> {
    let project = state
        .store
        .create_project(&body.name, body.synchronous_builds)
        .await?;
    Ok((StatusCode::CREATED, ok(json!(project))))
}

async fn get_project(
    State(state): State<AppState>,
    AxPath(project): AxPath<String>,
) -> Result<impl IntoResponse> {
    let project = state.store.get_project(&project).await?;
    Ok(ok(json!(project)))
}

async fn delete_project(
    State(state): State<AppState>,
    AxPath(project): AxPath<String>,
) -> Result<impl IntoResponse> {
    state.store.delete_project(&project).await?;
    Ok(ok(json!({})))
}

// ---- Builds ---------------------------------------------------------------

async fn list_builds(
    State(state): State<AppState>,
    AxPath(project): AxPath<String>,
    Query(p): Query<PageParams>,
) -> Result<impl IntoResponse> {
    let project = state.store.get_project(&project).await?;
    let (builds, total) = state
        .store
        .list_builds_for_project(project.id, p.limit, p.limit * p.page)
        .await?;
    Ok(ok(page_envelope(
        json!(builds),
        total,
        p.limit,
        p.page,
        &format!("/projects/{}/builds", project.name),
    )))
}

#[derive(Deserialize)]
struct CreateBuild {
    #[serde(rename = "trigger-name")]
    trigger_name: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(rename = "project-definition")]
    project_definition: String,
    #[serde(default)]
    params: BTreeMap<String, Value>,
    #[serde(default)]
    secrets: BTreeMap<String, String>,
}

/// Create a Build and instantiate the named trigger's Runs (§4.3, §4.5).
/// A thin illustrative stand-in for `jobserv/trigger.py`'s `trigger_build`:
/// the caller supplies the project definition and any event-level params or
/// secrets directly rather than this layer fetching/decrypting them from a
/// persisted Trigger row.
async fn create_build(
    State(state): State<AppState>,
    AxPath(project_name): AxPath<String>,
    Json(body): Json<CreateBuild>,
) -> Result<impl IntoResponse> {
    let project = state.store.get_project(&project_name).await?;
    let build = state
        .store
        .create_build(project.id, body.reason.as_deref(), Some(&body.trigger_name))
        .await?;

    state
        .artifacts
        .put_string(
            &crate::artifact_store::project_definition_path(&project_name, build.build_id),
            &body.project_definition,
        )
        .await?;

    let project_def = ProjectDefinition::parse(&body.project_definition)?;
    let trigger = project_def
        .get_trigger(&body.trigger_name)
        .ok_or_else(|| JobservError::NotFound(format!("trigger {}", body.trigger_name)))?
        .clone();

    let engine = TriggerEngine::new(&state.store, state.artifacts.as_ref());
    let ctx_urls = make_ctx_urls(&state.config, &project_name, build.build_id);
    engine
        .instantiate_trigger(
            &project_def,
            &build,
            &project_name,
            &body.trigger_name,
            &trigger.trigger_type,
            &body.params,
            &body.secrets,
            None,
            ctx_urls,
        )
        .await?;

    Ok((StatusCode::CREATED, ok(json!(build))))
}

async fn get_build(
    State(state): State<AppState>,
    AxPath((project_name, build_id)): AxPath<(String, i64)>,
) -> Result<impl IntoResponse> {
    let project = state.store.get_project(&project_name).await?;
    let build = state.store.get_build(project.id, build_id).await?;
    let runs = state.store.list_runs_for_build(build.id).await?;
    Ok(ok(json!({ "build": build, "runs": runs })))
}

async fn get_project_yml(
    State(state): State<AppState>,
    AxPath((project_name, build_id)): AxPath<(String, i64)>,
) -> Result<impl IntoResponse> {
    let yaml = state
        .artifacts
        .get_string(&crate::artifact_store::project_definition_path(&project_name, build_id))
        .await?;
    Ok(([("content-type", "application/x-yaml")], yaml))
}

// ---- Runs -------------------------------------------------------------

async fn load_run(state: &AppState, project: &str, build_id: i64, run_name: &str) -> Result<Run> {
    let project = state.store.get_project(project).await?;
    let build = state.store.get_build(project.id, build_id).await?;
    state.store.get_run(build.id, run_name).await
}

async fn get_run(
    State(state): State<AppState>,
    AxPath((project_name, build_id, run_name)): AxPath<(String, i64, String)>,
) -> Result<impl IntoResponse> {
    let run = load_run(&state, &project_name, build_id, &run_name).await?;
    let artifacts = state
        .artifacts
        .list(&format!("{project_name}/{build_id}/{run_name}"))
        .await
        .unwrap_or_default();
    Ok(ok(json!({ "run": run, "artifacts": artifacts })))
}

fn make_ctx_urls<'a>(
    config: &'a Config,
    project_name: &'a str,
    build_id: i64,
) -> impl Fn(&str) -> RunContext<'a> {
    let base = config.public_url.clone();
    move |run_name: &str| RunContext {
        project_name,
        build_id,
        run_url: format!("{base}/projects/{project_name}/builds/{build_id}/runs/{run_name}"),
        frontend_url: format!("{base}/projects/{project_name}/builds/{build_id}/runs/{run_name}"),
        runner_url: format!("{base}/projects/{project_name}/builds/{build_id}/runs/{run_name}/create_signed"),
    }
}

/// Header-driven run update (§4.6), mirroring `run_update`: request body
/// (if any) is appended to the console; `X-RUN-METADATA` sets metadata;
/// `X-RUN-STATUS` transitions status through the aggregator/trigger engine.
async fn run_update(
    State(state): State<AppState>,
    AxPath((project_name, build_id, run_name)): AxPath<(String, i64, String)>,
    Query(q): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let run = load_run(&state, &project_name, build_id, &run_name).await?;
    authenticate(
        &run,
        q.get("apikey").map(String::as_str),
        headers.get("authorization").and_then(|v| v.to_str().ok()),
    )?;

    let ingress = Ingress::new(&state.store, state.artifacts.as_ref());

    if !body.is_empty() {
        ingress.append_log(&project_name, build_id, &run, &body).await?;
    }

    if let Some(meta) = headers.get("x-run-metadata").and_then(|v| v.to_str().ok()) {
        ingress.set_metadata(run.id, meta).await?;
    }

    if let Some(status_str) = headers.get("x-run-status").and_then(|v| v.to_str().ok()) {
        let new_status: Status = status_str
            .parse()
            .map_err(|_| JobservError::validation(format!("unknown status {status_str}")))?;
        let ctx_urls = make_ctx_urls(&state.config, &project_name, build_id);
        ingress
            .set_status(
                &state.config.worker_state_dir,
                state.notifier.as_ref(),
                &project_name,
                build_id,
                &run,
                new_status,
                None::<WebhookPolicy>,
                ctx_urls,
            )
            .await?;
    }

    Ok(ok(json!({})))
}

async fn cancel_run(
    State(state): State<AppState>,
    AxPath((project_name, build_id, run_name)): AxPath<(String, i64, String)>,
) -> Result<impl IntoResponse> {
    let run = load_run(&state, &project_name, build_id, &run_name).await?;
    let ingress = Ingress::new(&state.store, state.artifacts.as_ref());
    ingress.cancel(run.id).await?;
    Ok(ok(json!({})))
}

#[derive(Deserialize)]
struct SignedUrlRequest {
    paths: Vec<String>,
    #[serde(default = "default_expiration")]
    expiration_s: u64,
}
fn default_expiration() -> u64 {
    1800
}

async fn create_signed_urls(
    State(state): State<AppState>,
    AxPath((project_name, build_id, run_name)): AxPath<(String, i64, String)>,
    Query(q): Query<BTreeMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<SignedUrlRequest>,
) -> Result<impl IntoResponse> {
    let run = load_run(&state, &project_name, build_id, &run_name).await?;
    authenticate(
        &run,
        q.get("apikey").map(String::as_str),
        headers.get("authorization").and_then(|v| v.to_str().ok()),
    )?;
    let ingress = Ingress::new(&state.store, state.artifacts.as_ref());
    let urls = ingress
        .request_signed_urls(&project_name, build_id, &run_name, &body.paths, body.expiration_s)
        .await?;
    Ok(ok(json!({ "urls": urls })))
}

/// Artifact/definition download, mirroring `run_get_artifact`/
/// `run_get_definition`: unauthenticated readers get secrets redacted out
/// of `.rundef.json`; an in-progress Run only ever serves `console.log`.
async fn get_artifact(
    State(state): State<AppState>,
    AxPath((project_name, build_id, run_name, rel)): AxPath<(String, i64, String, String)>,
) -> Result<Response> {
    let run = load_run(&state, &project_name, build_id, &run_name).await?;

    if rel == ".rundef.json" {
        let raw = state
            .artifacts
            .get_string(&rundef_path(&project_name, build_id, &run_name))
            .await?;
        let body = redact_for_unauthenticated(&raw)?;
        return Ok(([("content-type", "application/json")], body).into_response());
    }

    if !run.status.is_terminal() {
        if rel != "console.log" {
            return Err(JobservError::NotFound(
                "run in progress, no artifacts available".into(),
            ));
        }
        let content = state
            .artifacts
            .get_string(&console_path(&project_name, build_id, &run_name))
            .await
            .unwrap_or_default();
        let mut resp = ([("content-type", "text/plain")], content).into_response();
        resp.headers_mut()
            .insert("x-run-status", run.status.to_string().parse().unwrap());
        return Ok(resp);
    }

    let full_rel = format!("{project_name}/{build_id}/{run_name}/{rel}");
    if rel.ends_with(".html") {
        let content = state.artifacts.get_string(&full_rel).await?;
        return Ok(([("content-type", "text/html")], content).into_response());
    }
    let bytes = state.artifacts.get_bytes(&full_rel).await?;
    Ok(bytes.into_response())
}

// ---- Workers ----------------------------------------------------------

#[derive(Deserialize)]
struct RegisterWorker {
    name: String,
    distro: String,
    mem_total: i64,
    cpu_total: i64,
    cpu_type: String,
    concurrent_runs: i64,
    host_tags: String,
    api_key: String,
    #[serde(default)]
    surges_only: bool,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(body): Json<RegisterWorker>,
) -> Result<impl IntoResponse> {
    let hash = bcrypt::hash(&body.api_key, bcrypt::DEFAULT_COST)
        .map_err(|e| JobservError::Unexpected(e.into()))?;
    let worker = state
        .store
        .create_worker(
            &body.name,
            &body.distro,
            body.mem_total,
            body.cpu_total,
            &body.cpu_type,
            body.concurrent_runs,
            &body.host_tags,
            &hash,
            body.surges_only,
        )
        .await?;
    Ok((StatusCode::CREATED, ok(json!(worker))))
}

#[derive(Deserialize)]
struct UpdateWorker {
    #[serde(default)]
    enlisted: Option<bool>,
}

async fn update_worker(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
    Json(body): Json<UpdateWorker>,
) -> Result<impl IntoResponse> {
    if let Some(enlisted) = body.enlisted {
        state.store.set_worker_enlisted(&name, enlisted).await?;
    }
    let worker = state.store.get_worker(&name).await?;
    Ok(ok(json!(worker)))
}

/// Poll: record the ping, then hand back at most one assigned Run's
/// synthesized run-definition (with internal URLs already rewritten to
/// `public_url` by [`make_ctx_urls`]'s pattern, applied when the
/// run-definition was originally synthesized) — not the bare Run row, which
/// carries no script/container/env/secrets for the worker to act on.
async fn poll_worker(
    State(state): State<AppState>,
    AxPath(name): AxPath<String>,
) -> Result<impl IntoResponse> {
    let worker = state.store.get_worker(&name).await?;
    state.store.touch_worker_ping(&name).await?;

    let monitor = SurgeMonitor::new(
        &state.store,
        state.notifier.as_ref(),
        state.config.worker_state_dir.clone(),
        state.config.surge_support_ratio as i64,
        state.config.ping_log_max_bytes,
    );
    let surging_tags = monitor.surging_tags().unwrap_or_default();

    let dispatcher = Dispatcher::new(&state.store);
    let run = dispatcher.pop_queued(&worker, &surging_tags).await?;

    let rundef = match &run {
        Some(run) => {
            let build = state.store.get_build_by_id(run.build_id).await?;
            let project_name = state.store.get_project_name_by_id(build.project_id).await?;
            let raw = state
                .artifacts
                .get_string(&rundef_path(&project_name, build.build_id, &run.name))
                .await?;
            Some(serde_json::from_str::<Value>(&raw).map_err(|e| JobservError::Unexpected(e.into()))?)
        }
        None => None,
    };
    Ok(ok(json!({ "run": rundef })))
}

// ---- Health -------------------------------------------------------------

async fn health_runs(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let counts = status_counts(&state.store).await?;
    let workers = state.store.list_workers(false).await?;
    Ok(ok(json!({ "by_status": counts, "workers": workers })))
}
