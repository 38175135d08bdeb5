//! Run-definition synthesis (§4.3): combine a Run record, its trigger and
//! project definition, and the effective params/secrets into the JSON
//! document handed to a worker. Grounded on
//! `ProjectDefinition.get_run_definition` in `jobserv/project.py`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::error::{JobservError, Result};
use crate::store::models::Run;

use super::{ProjectDefinition, RunDef, TriggerDef};

/// Identifiers and URLs the synthesized run-definition needs but that the
/// pipeline model itself has no business knowing how to construct.
pub struct RunContext<'a> {
    pub project_name: &'a str,
    pub build_id: i64,
    pub run_url: String,
    pub frontend_url: String,
    pub runner_url: String,
}

#[allow(clippy::too_many_arguments)]
pub fn synthesize(
    project: &ProjectDefinition,
    trigger: &TriggerDef,
    run_def: &RunDef,
    run: &Run,
    ctx: &RunContext,
    event_params: &BTreeMap<String, Value>,
    secrets: &BTreeMap<String, String>,
) -> Result<String> {
    let host_tag = run_def
        .host_tag
        .as_deref()
        .unwrap_or(&run.host_tag)
        .to_lowercase();

    let mut doc = json!({
        "project": ctx.project_name,
        "build": ctx.build_id,
        "run": run.name,
        "timeout": project.timeout(),
        "api_key": run.api_key,
        "run_url": ctx.run_url,
        "frontend_url": ctx.frontend_url,
        "runner_url": ctx.runner_url,
        "trigger_type": trigger.trigger_type,
        "container": run_def.container,
        "container-auth": run_def.container_auth,
        "container-user": run_def.container_user,
        "container-entrypoint": run_def.container_entrypoint,
        "privileged": run_def.privileged,
        "persistent-volumes": run_def.persistent_volumes,
        "test-grepping": test_grepping_json(run_def),
        "host-tag": host_tag,
    });

    if let Some(script) = &run_def.script {
        let body = project
            .scripts()
            .get(script)
            .ok_or_else(|| JobservError::Validation(vec![format!("unknown script {script}")]))?;
        doc["script"] = json!(body);
    } else if let Some(repo_ref) = &run_def.script_repo {
        let repo = project.script_repos().get(&repo_ref.name).ok_or_else(|| {
            JobservError::Validation(vec![format!("unknown script-repo {}", repo_ref.name)])
        })?;
        if let Some(token) = &repo.token {
            for part in token.split(':').filter(|p| !p.is_empty()) {
                if !secrets.contains_key(part) {
                    return Err(JobservError::Validation(vec![format!(
                        "the script-repo requires a token ({part}) not defined in the run's secrets"
                    )]));
                }
            }
        }
        doc["script-repo"] = json!({
            "clone-url": repo.clone_url,
            "git-ref": repo.git_ref,
            "token": repo.token,
            "path": repo_ref.path,
        });
    } else {
        return Err(JobservError::Validation(vec![
            "run carries neither script nor script-repo".to_string(),
        ]));
    }

    if let Some(auth) = &run_def.container_auth {
        if !secrets.contains_key(auth) {
            return Err(JobservError::Validation(vec![format!(
                "\"container-auth\" requires a secret ({auth}) not defined in the run's secrets"
            )]));
        }
    }

    let mut env = BTreeMap::new();
    for (k, v) in project.params() {
        env.insert(k.clone(), stringify(v));
    }
    for (k, v) in &trigger.params {
        env.insert(k.clone(), stringify(v));
    }
    for (k, v) in &run_def.params {
        env.insert(k.clone(), stringify(v));
    }
    for (k, v) in event_params {
        env.insert(k.clone(), stringify(v));
    }
    env.insert("H_PROJECT".to_string(), ctx.project_name.to_string());
    env.insert("H_BUILD".to_string(), ctx.build_id.to_string());
    env.insert("H_RUN".to_string(), run.name.clone());

    doc["env"] = json!(env);
    doc["secrets"] = json!(secrets);

    Ok(serde_json::to_string_pretty(&doc).map_err(|e| JobservError::Unexpected(e.into()))?)
}

fn test_grepping_json(run_def: &RunDef) -> Value {
    match &run_def.test_grepping {
        None => Value::Null,
        Some(tg) => json!({
            "test-pattern": tg.test_pattern,
            "result-pattern": tg.result_pattern,
            "fixupdict": tg.fixupdict,
        }),
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip an unauthenticated reader's view of a run-definition: replace every
/// secret value with `"TODO"` and remove the `api_key` field (§8 invariant).
pub fn redact_for_unauthenticated(rundef_json: &str) -> Result<String> {
    let mut doc: Value =
        serde_json::from_str(rundef_json).map_err(|e| JobservError::Unexpected(e.into()))?;
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("api_key");
        if let Some(Value::Object(secrets)) = obj.get_mut("secrets") {
            for (_, v) in secrets.iter_mut() {
                *v = Value::String("TODO".to_string());
            }
        }
    }
    serde_json::to_string_pretty(&doc).map_err(|e| JobservError::Unexpected(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ProjectDefinition;

    fn sample_run() -> Run {
        Run {
            id: 1,
            build_id: 1,
            name: "unit".to_string(),
            status: crate::status::Status::Queued,
            api_key: "secret-token".to_string(),
            trigger_name: Some("git_poller".to_string()),
            host_tag: "amd64".to_string(),
            queue_priority: 0,
            worker_name: None,
            meta: None,
        }
    }

    const MINIMAL: &str = r#"
timeout: 30
scripts:
  build: "echo ok"
triggers:
  - name: git_poller
    type: git_poller
    runs:
      - name: unit
        container: alpine
        host-tag: amd64
        script: build
"#;

    #[test]
    fn synthesizes_script_run() {
        let def = ProjectDefinition::parse(MINIMAL).unwrap();
        let trigger = def.get_trigger("git_poller").unwrap().clone();
        let run_def = trigger.runs[0].clone();
        let run = sample_run();
        let ctx = RunContext {
            project_name: "p",
            build_id: 1,
            run_url: "https://jobserv.example/run".to_string(),
            frontend_url: "https://jobserv.example/run".to_string(),
            runner_url: "https://jobserv.example/runner".to_string(),
        };
        let out = synthesize(
            &def,
            &trigger,
            &run_def,
            &run,
            &ctx,
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(out.contains("\"script\": \"echo ok\""));
        assert!(out.contains("\"H_PROJECT\": \"p\""));
        let redacted = redact_for_unauthenticated(&out).unwrap();
        assert!(!redacted.contains("api_key"));
    }

    #[test]
    fn rejects_missing_script_repo_token_secret() {
        let yaml = r#"
timeout: 30
script-repos:
  repo:
    clone-url: "https://example.com/repo.git"
    token: "deploy-token"
triggers:
  - name: t
    type: simple
    runs:
      - name: r
        container: alpine
        host-tag: amd64
        script-repo:
          name: repo
          path: run.sh
"#;
        let def = ProjectDefinition::parse(yaml).unwrap();
        let trigger = def.get_trigger("t").unwrap().clone();
        let run_def = trigger.runs[0].clone();
        let run = sample_run();
        let ctx = RunContext {
            project_name: "p",
            build_id: 1,
            run_url: "u".to_string(),
            frontend_url: "u".to_string(),
            runner_url: "u".to_string(),
        };
        let err = synthesize(
            &def,
            &trigger,
            &run_def,
            &run,
            &ctx,
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, JobservError::Validation(_)));
    }
}
