//! Project-definition parsing, validation, `loop-on` expansion (§4.3).
//! Grounded on `jobserv/project.py`'s `ProjectDefinition`: same validation
//! order (schema-ish checks, then recursion-depth check, then loop
//! expansion with its own length check), reshaped into a typed Rust model
//! parsed with `serde_yaml` instead of `pykwalify`.

pub mod rundef;

use std::collections::BTreeMap;

use itertools::Itertools;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{JobservError, Result};

const KNOWN_TRIGGER_TYPES: &[&str] = &[
    "git_poller",
    "github_pr",
    "gitlab_mr",
    "simple",
    "lava",
    "lava_pr",
    "lava_mr",
];

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptRepo {
    #[serde(rename = "clone-url")]
    pub clone_url: String,
    #[serde(rename = "git-ref", default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopOnEntry {
    pub param: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChildTriggerRef {
    pub name: String,
    #[serde(rename = "run-names", default)]
    pub run_names: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunScriptRepoRef {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestGrepping {
    #[serde(rename = "test-pattern", default)]
    pub test_pattern: Option<String>,
    #[serde(rename = "result-pattern")]
    pub result_pattern: String,
    #[serde(default)]
    pub fixupdict: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunDef {
    pub name: String,
    pub container: String,
    #[serde(rename = "host-tag", default)]
    pub host_tag: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(rename = "script-repo", default)]
    pub script_repo: Option<RunScriptRepoRef>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(rename = "loop-on", default)]
    pub loop_on: Vec<LoopOnEntry>,
    #[serde(default)]
    pub triggers: Vec<ChildTriggerRef>,
    #[serde(rename = "container-auth", default)]
    pub container_auth: Option<String>,
    #[serde(rename = "container-user", default)]
    pub container_user: Option<String>,
    #[serde(rename = "container-entrypoint", default)]
    pub container_entrypoint: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(rename = "persistent-volumes", default)]
    pub persistent_volumes: Vec<String>,
    #[serde(rename = "test-grepping", default)]
    pub test_grepping: Option<TestGrepping>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerDef {
    pub name: String,
    #[serde(rename = "type")]
    pub trigger_type: String,
    pub runs: Vec<RunDef>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub triggers: Vec<ChildTriggerRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectDefinitionData {
    pub timeout: Option<i64>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
    #[serde(rename = "script-repos", default)]
    pub script_repos: BTreeMap<String, ScriptRepo>,
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

/// A validated, loop-expanded project definition.
#[derive(Debug)]
pub struct ProjectDefinition {
    data: ProjectDefinitionData,
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl ProjectDefinition {
    pub fn timeout(&self) -> i64 {
        self.data.timeout.unwrap_or_default()
    }

    pub fn scripts(&self) -> &BTreeMap<String, String> {
        &self.data.scripts
    }

    pub fn script_repos(&self) -> &BTreeMap<String, ScriptRepo> {
        &self.data.script_repos
    }

    pub fn triggers(&self) -> &[TriggerDef] {
        &self.data.triggers
    }

    pub fn params(&self) -> &BTreeMap<String, Value> {
        &self.data.params
    }

    pub fn get_trigger(&self, name: &str) -> Option<&TriggerDef> {
        self.data.triggers.iter().find(|t| t.name == name)
    }

    /// Parse, validate and loop-expand a project definition in one pass
    /// (mirrors `ProjectDefinition.validate_data`).
    pub fn parse(yaml: &str) -> Result<Self> {
        let mut data: ProjectDefinitionData = serde_yaml::from_str(yaml)
            .map_err(|e| JobservError::Validation(vec![format!("invalid project YAML: {e}")]))?;
        validate_structure(&data)?;
        check_trigger_depth(&data)?;
        expand_run_loops(&mut data)?;
        Ok(Self { data })
    }

    pub fn into_data(self) -> ProjectDefinitionData {
        self.data
    }
}

fn validate_structure(data: &ProjectDefinitionData) -> Result<()> {
    let mut errors = Vec::new();

    if data.timeout.is_none() {
        errors.push("\"timeout\" is required".to_string());
    }
    if data.triggers.is_empty() {
        errors.push("at least one trigger is required".to_string());
    }

    for trigger in &data.triggers {
        let path = format!("triggers/{}", trigger.name);
        if !KNOWN_TRIGGER_TYPES.contains(&trigger.trigger_type.as_str()) {
            errors.push(format!("{path}: no such trigger type: {}", trigger.trigger_type));
        }
        for run in &trigger.runs {
            let rpath = format!("{path}/runs/{}", run.name);
            match (&run.script, &run.script_repo) {
                (Some(_), Some(_)) => {
                    errors.push(format!("{rpath}: \"script\" and \"script-repo\" are mutually exclusive"))
                }
                (Some(script), None) => {
                    if !data.scripts.contains_key(script) {
                        errors.push(format!("{rpath}: script does not exist: {script}"));
                    }
                }
                (None, Some(repo)) => {
                    if !data.script_repos.contains_key(&repo.name) {
                        errors.push(format!("{rpath}: script repo does not exist: {}", repo.name));
                    }
                }
                (None, None) => errors.push(format!("{rpath}: \"script\" or \"script-repo\" is required")),
            }

            let has_host_tag = run.host_tag.is_some()
                || run.loop_on.iter().any(|l| l.param == "host-tag");
            if !has_host_tag {
                errors.push(format!(
                    "{rpath}: \"host-tag\" or loop-on host-tag parameter required"
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(JobservError::Validation(errors))
    }
}

/// Trigger recursion depth must not exceed 2, starting count at top-level
/// triggers (mirrors `_test_recursive_triggers`/`_check_trigger_depth`).
fn check_trigger_depth(data: &ProjectDefinitionData) -> Result<()> {
    fn walk(data: &ProjectDefinitionData, child: &ChildTriggerRef, depth: i32) -> Result<()> {
        if depth == 0 {
            return Err(JobservError::Validation(vec![format!(
                "triggers/{}: trigger recursion depth exceeded",
                child.name
            )]));
        }
        if let Some(t) = data.triggers.iter().find(|t| t.name == child.name) {
            for run in &t.runs {
                for grandchild in &run.triggers {
                    walk(data, grandchild, depth - 1)?;
                }
            }
            for grandchild in &t.triggers {
                walk(data, grandchild, depth - 1)?;
            }
        }
        Ok(())
    }

    for parent in &data.triggers {
        for run in &parent.runs {
            for child in &run.triggers {
                walk(data, child, 2)?;
            }
        }
        for child in &parent.triggers {
            walk(data, child, 2)?;
        }
    }
    Ok(())
}

/// Cartesian-product expansion over each run's `loop-on` entries (§4.3).
/// Idempotent: a run with no `loop-on` entry passes through unchanged, so
/// calling this twice on an already-expanded definition is a no-op.
fn expand_run_loops(data: &mut ProjectDefinitionData) -> Result<()> {
    let mut errors = Vec::new();

    for trigger in &mut data.triggers {
        let mut expanded = Vec::with_capacity(trigger.runs.len());
        for run in trigger.runs.drain(..) {
            if run.loop_on.is_empty() {
                expanded.push(run);
                continue;
            }
            let names: Vec<&str> = run.loop_on.iter().map(|l| l.param.as_str()).collect();
            let value_sets: Vec<&[String]> =
                run.loop_on.iter().map(|l| l.values.as_slice()).collect();

            for combo in cartesian_product(&value_sets) {
                let loop_token = combo.join("-");
                let mut r = run.clone();
                r.loop_on.clear();
                r.name = run.name.replace("{loop}", &loop_token);

                for (i, val) in combo.iter().enumerate() {
                    if names[i] == "host-tag" {
                        r.host_tag = Some(val.clone());
                    } else {
                        r.params.insert(names[i].to_string(), Value::String(val.clone()));
                    }
                }

                for child in &mut r.triggers {
                    child.name = child.name.replace("{loop}", &loop_token);
                    if let Some(run_names) = &child.run_names {
                        child.run_names = Some(
                            run_names
                                .replace("{name}", "\u{0}NAME\u{0}")
                                .replace("{loop}", &loop_token)
                                .replace("\u{0}NAME\u{0}", "{name}"),
                        );
                    }
                }

                expanded.push(r);
            }
        }
        trigger.runs = expanded;

        for run in &trigger.runs {
            if run.name.len() >= 80 {
                errors.push(format!(
                    "triggers/{}/runs/{}: name of run must be less than 80 characters",
                    trigger.name, run.name
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(JobservError::Validation(errors))
    }
}

/// Cartesian product of each `loop-on` entry's value set, via
/// `itertools::multi_cartesian_product` (outer dimension varies slowest,
/// matching the nesting order `loop-on:` entries are declared in).
fn cartesian_product(sets: &[&[String]]) -> Vec<Vec<String>> {
    sets.iter()
        .map(|set| set.iter().cloned())
        .multi_cartesian_product()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn parses_minimal_definition() {
        let def = ProjectDefinition::parse(MINIMAL).unwrap();
        assert_eq!(def.timeout(), 30);
        assert_eq!(def.triggers().len(), 1);
        assert_eq!(def.triggers()[0].runs[0].name, "unit");
    }

    #[test]
    fn rejects_missing_timeout() {
        let yaml = MINIMAL.replacen("timeout: 30\n", "", 1);
        let err = ProjectDefinition::parse(&yaml).unwrap_err();
        assert!(matches!(err, JobservError::Validation(_)));
    }

    #[test]
    fn rejects_script_and_script_repo_together() {
        let yaml = r#"
timeout: 30
scripts:
  build: "echo ok"
script-repos:
  repo:
    clone-url: "https://example.com/repo.git"
triggers:
  - name: t
    type: simple
    runs:
      - name: r
        container: alpine
        host-tag: amd64
        script: build
        script-repo:
          name: repo
          path: run.sh
"#;
        let err = ProjectDefinition::parse(yaml).unwrap_err();
        match err {
            JobservError::Validation(msgs) => {
                assert!(msgs.iter().any(|m| m.contains("mutually exclusive")))
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn expands_loop_on_into_named_runs() {
        let yaml = r#"
timeout: 30
scripts:
  build: "echo ok"
triggers:
  - name: t
    type: simple
    runs:
      - name: unit-{loop}
        container: alpine
        script: build
        loop-on:
          - param: host-tag
            values: [amd64, arm64]
"#;
        let def = ProjectDefinition::parse(yaml).unwrap();
        let names: Vec<&str> = def.triggers()[0]
            .runs
            .iter()
            .map(|r| r.name.as_str())
            .collect();
        assert_eq!(names, vec!["unit-amd64", "unit-arm64"]);
    }

    #[test]
    fn expansion_is_idempotent() {
        let yaml = r#"
timeout: 30
scripts:
  build: "echo ok"
triggers:
  - name: t
    type: simple
    runs:
      - name: unit-{loop}
        container: alpine
        script: build
        loop-on:
          - param: host-tag
            values: [amd64, arm64]
"#;
        let mut data: ProjectDefinitionData = serde_yaml::from_str(yaml).unwrap();
        expand_run_loops(&mut data).unwrap();
        let first: Vec<String> = data.triggers[0].runs.iter().map(|r| r.name.clone()).collect();
        expand_run_loops(&mut data).unwrap();
        let second: Vec<String> = data.triggers[0].runs.iter().map(|r| r.name.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_trigger_depth_over_two() {
        let yaml = r#"
timeout: 30
scripts:
  build: "echo ok"
triggers:
  - name: a
    type: simple
    runs:
      - name: ra
        container: alpine
        host-tag: amd64
        script: build
        triggers:
          - name: b
  - name: b
    type: simple
    runs:
      - name: rb
        container: alpine
        host-tag: amd64
        script: build
        triggers:
          - name: c
  - name: c
    type: simple
    runs:
      - name: rc
        container: alpine
        host-tag: amd64
        script: build
        triggers:
          - name: d
  - name: d
    type: simple
    runs:
      - name: rd
        container: alpine
        host-tag: amd64
        script: build
"#;
        let err = ProjectDefinition::parse(yaml).unwrap_err();
        assert!(matches!(err, JobservError::Validation(_)));
    }
}
