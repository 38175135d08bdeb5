//! End-to-end project-definition -> run-definition synthesis, exercising
//! parse/validate/loop-expand together with `rundef::synthesize` the way a
//! real trigger fan-out would chain them.

use std::collections::BTreeMap;

use jobserv_core::pipeline::rundef::{redact_for_unauthenticated, synthesize, RunContext};
use jobserv_core::pipeline::ProjectDefinition;
use jobserv_core::status::Status;
use jobserv_core::store::models::Run;

const WITH_SECRETS: &str = r#"
timeout: 45
scripts:
  build: "echo ok"
script-repos:
  deploy-scripts:
    clone-url: "https://example.com/deploy.git"
    token: "deploy-token"
triggers:
  - name: t
    type: simple
    params:
      CHANNEL: stable
    runs:
      - name: amd64-{loop}
        container: alpine
        container-auth: registry-cred
        loop-on:
          - param: host-tag
            values: [amd64, arm64]
        script-repo:
          name: deploy-scripts
          path: run.sh
"#;

fn run(name: &str) -> Run {
    Run {
        id: 7,
        build_id: 3,
        name: name.to_string(),
        status: Status::Queued,
        api_key: "run-secret-key".to_string(),
        trigger_name: Some("t".to_string()),
        host_tag: "amd64".to_string(),
        queue_priority: 0,
        worker_name: None,
        meta: None,
    }
}

fn ctx() -> RunContext<'static> {
    RunContext {
        project_name: "widgets",
        build_id: 3,
        run_url: "https://jobserv.example/widgets/3/amd64-amd64".to_string(),
        frontend_url: "https://jobserv.example/widgets/3/amd64-amd64".to_string(),
        runner_url: "https://jobserv.example/widgets/3/amd64-amd64/create_signed".to_string(),
    }
}

#[test]
fn loop_expansion_feeds_straight_into_synthesis() {
    let def = ProjectDefinition::parse(WITH_SECRETS).unwrap();
    let trigger = def.get_trigger("t").unwrap().clone();
    assert_eq!(trigger.runs.len(), 2);

    let run_def = trigger
        .runs
        .iter()
        .find(|r| r.name == "amd64-amd64")
        .expect("loop expansion produced the amd64 variant")
        .clone();

    let mut secrets = BTreeMap::new();
    secrets.insert("deploy-token".to_string(), "tok".to_string());
    secrets.insert("registry-cred".to_string(), "cred".to_string());

    let mut event_params = BTreeMap::new();
    event_params.insert("CHANNEL".to_string(), serde_json::json!("canary"));

    let out = synthesize(&def, &trigger, &run_def, &run("amd64-amd64"), &ctx(), &event_params, &secrets).unwrap();

    // Event params win over trigger params (§4.3 precedence).
    assert!(out.contains("\"CHANNEL\": \"canary\""));
    assert!(out.contains("\"host-tag\": \"amd64\""));
    assert!(out.contains("\"clone-url\": \"https://example.com/deploy.git\""));

    let redacted = redact_for_unauthenticated(&out).unwrap();
    assert!(!redacted.contains("run-secret-key"));
    assert!(redacted.contains("\"deploy-token\": \"TODO\""));
}

#[test]
fn missing_container_auth_secret_is_rejected_before_dispatch() {
    let def = ProjectDefinition::parse(WITH_SECRETS).unwrap();
    let trigger = def.get_trigger("t").unwrap().clone();
    let run_def = trigger.runs[0].clone();

    let mut secrets = BTreeMap::new();
    secrets.insert("deploy-token".to_string(), "tok".to_string());
    // registry-cred deliberately missing.

    let err = synthesize(&def, &trigger, &run_def, &run("amd64-amd64"), &ctx(), &BTreeMap::new(), &secrets)
        .unwrap_err();
    assert!(matches!(err, jobserv_core::error::JobservError::Validation(_)));
}
