//! The aggregator's five-step lock-held contract end to end: a Run going
//! Queued -> Running -> Passed recomputes the Build's cumulative status,
//! fans out to the next trigger stage, and reclaims the Build lock once
//! terminal (§4.5).

mod common;

use std::collections::BTreeMap;

use jobserv_core::aggregator::process_run_status_change;
use jobserv_core::artifact_store::{project_definition_path, rundef_path, ArtifactStore};
use jobserv_core::notify::LoggingNotifier;
use jobserv_core::pipeline::rundef::RunContext;
use jobserv_core::pipeline::ProjectDefinition;
use jobserv_core::status::Status;
use jobserv_core::trigger_engine::TriggerEngine;

fn ctx_urls<'a>(project_name: &'a str, build_id: i64) -> impl Fn(&str) -> RunContext<'a> + 'a {
    move |run_name: &str| RunContext {
        project_name,
        build_id,
        run_url: format!("https://jobserv.example/projects/{project_name}/builds/{build_id}/runs/{run_name}"),
        frontend_url: format!(
            "https://jobserv.example/projects/{project_name}/builds/{build_id}/runs/{run_name}"
        ),
        runner_url: format!(
            "https://jobserv.example/projects/{project_name}/builds/{build_id}/runs/{run_name}/create_signed"
        ),
    }
}

#[tokio::test]
async fn run_passing_recomputes_build_and_fans_out_next_stage() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let artifacts = common::test_artifacts(dir.path());
    let notifier = LoggingNotifier;
    let state_dir = dir.path().join("worker-state");

    let project = store.create_project("widgets", false).await.unwrap();
    let build = store
        .create_build(project.id, Some("manual"), Some("git_poller"))
        .await
        .unwrap();
    artifacts
        .put_string(&project_definition_path("widgets", build.build_id), common::CHAINED_PROJECT)
        .await
        .unwrap();

    let mut event_params = BTreeMap::new();
    event_params.insert("CHANNEL".to_string(), serde_json::json!("stable"));
    let mut event_secrets = BTreeMap::new();
    event_secrets.insert("DEPLOY_TOKEN".to_string(), "tok-123".to_string());

    let project_def = ProjectDefinition::parse(common::CHAINED_PROJECT).unwrap();
    let engine = TriggerEngine::new(&store, &artifacts);
    let created = engine
        .instantiate_trigger(
            &project_def,
            &build,
            "widgets",
            "git_poller",
            "git_poller",
            &event_params,
            &event_secrets,
            None,
            ctx_urls("widgets", build.build_id),
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let build_run = &created[0];
    assert_eq!(build_run.name, "build");

    process_run_status_change(
        &store,
        &state_dir,
        &artifacts,
        &notifier,
        "widgets",
        build_run.id,
        Status::Running,
        None,
        ctx_urls("widgets", build.build_id),
    )
    .await
    .unwrap();

    let result = process_run_status_change(
        &store,
        &state_dir,
        &artifacts,
        &notifier,
        "widgets",
        build_run.id,
        Status::Passed,
        None,
        ctx_urls("widgets", build.build_id),
    )
    .await
    .unwrap();

    assert!(result.run_became_terminal);
    assert!(result.build_status_changed);
    assert_eq!(result.build.status, Status::Passed);

    let runs = store.list_runs_for_build(build.id).await.unwrap();
    let names: Vec<&str> = runs.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"build"));
    assert!(names.contains(&"deploy"));
    let deploy = runs.iter().find(|r| r.name == "deploy").unwrap();
    assert_eq!(deploy.status, Status::Queued);
    assert_eq!(deploy.trigger_name.as_deref(), Some("deploy"));

    // The fanned-out child Run inherits the env/secrets of the Run that
    // triggered it, not an empty map (§4.5's env-inheritance chain).
    let deploy_rundef = artifacts
        .get_string(&rundef_path("widgets", build.build_id, "deploy"))
        .await
        .unwrap();
    assert!(deploy_rundef.contains("\"CHANNEL\": \"stable\""));
    assert!(deploy_rundef.contains("\"DEPLOY_TOKEN\": \"tok-123\""));

    // The Build reached a terminal recomputed status, so its lock file was
    // reclaimed rather than left for a caller to clean up.
    let lock_path = state_dir.join(format!("Build-{}.lock", build.id));
    assert!(!lock_path.exists());
}

#[tokio::test]
async fn non_terminal_transition_leaves_lock_file_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let artifacts = common::test_artifacts(dir.path());
    let notifier = LoggingNotifier;
    let state_dir = dir.path().join("worker-state");

    let project = store.create_project("widgets2", false).await.unwrap();
    let build = store.create_build(project.id, None, None).await.unwrap();
    let run = store
        .create_run(build.id, "unit", "key", None, "amd64", 0)
        .await
        .unwrap();

    let result = process_run_status_change(
        &store,
        &state_dir,
        &artifacts,
        &notifier,
        "widgets2",
        run.id,
        Status::Running,
        None,
        ctx_urls("widgets2", build.build_id),
    )
    .await
    .unwrap();

    assert!(!result.run_became_terminal);
    assert_eq!(result.build.status, Status::Running);
    let lock_path = state_dir.join(format!("Build-{}.lock", build.id));
    assert!(lock_path.exists());
}
