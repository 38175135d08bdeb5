//! Trigger fan-out (§4.5 step 4): on Run/Build completion, instantiate
//! child Runs from the project definition and apply trigger-type upgrades.
//! Grounded on `jobserv/trigger.py`'s `trigger_runs`/`_trigger_run`, reshaped
//! around the typed [`crate::pipeline`] model and [`ArtifactStore`] trait.

use std::collections::BTreeMap;

use rand::Rng;
use serde_json::Value;

use crate::artifact_store::{project_definition_path, rundef_path, ArtifactStore};
use crate::error::{JobservError, Result};
use crate::notify::Notifier;
use crate::pipeline::rundef::{synthesize, RunContext};
use crate::pipeline::ProjectDefinition;
use crate::status::Status;
use crate::store::models::{Build, Run};
use crate::store::Store;

/// A 32-char cryptographically-random token, fresh per Run (§3).
pub fn random_api_key() -> String {
    let mut rng = rand::thread_rng();
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

/// Trigger-type upgrade table (§4.5): ensures status keeps reporting to the
/// originating SCM PR/MR as child Runs are instantiated down the chain.
pub fn upgrade_trigger_type(parent_trigger_type: &str, child_trigger_type: &str) -> String {
    match (parent_trigger_type, child_trigger_type) {
        ("github_pr", "simple") => "github_pr",
        ("github_pr", "lava") => "lava_pr",
        ("gitlab_mr", "simple") => "gitlab_mr",
        ("gitlab_mr", "lava") => "lava_mr",
        ("git_poller", "simple") => "git_poller",
        _ => child_trigger_type,
    }
    .to_string()
}

pub struct TriggerEngine<'a> {
    store: &'a Store,
    artifacts: &'a dyn ArtifactStore,
}

impl<'a> TriggerEngine<'a> {
    pub fn new(store: &'a Store, artifacts: &'a dyn ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    async fn load_project_definition(
        &self,
        project_name: &str,
        build_id: i64,
    ) -> Result<ProjectDefinition> {
        let yaml = self
            .artifacts
            .get_string(&project_definition_path(project_name, build_id))
            .await?;
        ProjectDefinition::parse(&yaml)
    }

    /// A Run's own `env`/`secrets`, as persisted in its `.rundef.json` at
    /// instantiation time — the parent env/secrets a child trigger fanned
    /// out from this Run inherits (§4.5, grounded on `jobserv/api/run.py:
    /// _handle_triggers`'s `rundef.get('env', {})`/`rundef.get('secrets')`).
    async fn load_run_env_secrets(
        &self,
        project_name: &str,
        build_id: i64,
        run_name: &str,
    ) -> Result<(BTreeMap<String, Value>, BTreeMap<String, String>)> {
        let raw = self
            .artifacts
            .get_string(&rundef_path(project_name, build_id, run_name))
            .await?;
        let doc: Value = serde_json::from_str(&raw).map_err(|e| JobservError::Unexpected(e.into()))?;
        let env = doc
            .get("env")
            .and_then(Value::as_object)
            .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let secrets = doc
            .get("secrets")
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Ok((env, secrets))
    }

    /// Instantiate every Run declared by `child_trigger_name`, writing each
    /// Run's synthesized run-definition to artifact storage. A duplicate
    /// run-name within the Build surfaces as `Conflict`, never a raw
    /// storage error (§4.5, §8).
    #[allow(clippy::too_many_arguments)]
    pub async fn instantiate_trigger<'cu>(
        &self,
        project_def: &ProjectDefinition,
        build: &Build,
        project_name: &str,
        child_trigger_name: &str,
        parent_trigger_type: &str,
        parent_env: &BTreeMap<String, Value>,
        parent_secrets: &BTreeMap<String, String>,
        run_name_pattern: Option<&str>,
        ctx_urls: impl Fn(&str) -> RunContext<'cu>,
    ) -> Result<Vec<Run>> {
        let child_trigger = project_def
            .get_trigger(child_trigger_name)
            .ok_or_else(|| JobservError::NotFound(format!("trigger {child_trigger_name}")))?
            .clone();

        let upgraded_type = upgrade_trigger_type(parent_trigger_type, &child_trigger.trigger_type);
        let mut upgraded_trigger = child_trigger.clone();
        upgraded_trigger.trigger_type = upgraded_type;

        let mut created = Vec::with_capacity(child_trigger.runs.len());
        for run_def in &child_trigger.runs {
            let run_name = match run_name_pattern {
                Some(pattern) => pattern.replace("{name}", &run_def.name),
                None => run_def.name.clone(),
            };
            let host_tag = run_def.host_tag.clone().unwrap_or_default();
            let api_key = random_api_key();

            let run = self
                .store
                .create_run(build.id, &run_name, &api_key, Some(child_trigger_name), &host_tag, 0)
                .await?;

            let ctx = ctx_urls(&run_name);
            let rundef_json = synthesize(
                project_def,
                &upgraded_trigger,
                run_def,
                &run,
                &ctx,
                parent_env,
                parent_secrets,
            )?;
            self.artifacts
                .put_string(&rundef_path(project_name, build.build_id, &run_name), &rundef_json)
                .await?;

            created.push(run);
        }
        Ok(created)
    }

    /// §4.5 step 4, Run-completion branch: if the Run `PASSED`, walk its
    /// matching trigger's run entry and instantiate every declared child.
    pub async fn on_run_terminal<'cu>(
        &self,
        build: &Build,
        project_name: &str,
        run: &Run,
        ctx_urls: impl Fn(&str) -> RunContext<'cu>,
    ) -> Result<()> {
        if run.status != Status::Passed {
            return Ok(());
        }
        let Some(trigger_name) = run.trigger_name.clone() else {
            return Ok(());
        };
        let project_def = self.load_project_definition(project_name, build.build_id).await?;
        let trigger = project_def
            .get_trigger(&trigger_name)
            .ok_or_else(|| JobservError::NotFound(format!("trigger {trigger_name}")))?
            .clone();

        // Loop-expanded run names may no longer literally match a run
        // entry's own name (the entry was the template); fall back to the
        // first run entry carrying child triggers with a matching prefix.
        let Some(run_def) = trigger
            .runs
            .iter()
            .find(|r| r.name == run.name || run.name.starts_with(&format!("{}-", r.name)))
        else {
            return Ok(());
        };
        if run_def.triggers.is_empty() {
            return Ok(());
        }

        let (parent_env, parent_secrets) = self
            .load_run_env_secrets(project_name, build.build_id, &run.name)
            .await?;

        for child in &run_def.triggers {
            self.instantiate_trigger(
                &project_def,
                build,
                project_name,
                &child.name,
                &trigger.trigger_type,
                &parent_env,
                &parent_secrets,
                child.run_names.as_deref(),
                &ctx_urls,
            )
            .await?;
        }
        Ok(())
    }

    /// §4.5 step 4, Build-completion branch: apply the trigger's
    /// email/webhook policy, then (only if the Build `PASSED`) instantiate
    /// the trigger's Build-level `triggers[]` with the trigger URL rewritten
    /// to point at the Build rather than the Run (§10).
    pub async fn on_build_terminal<'cu>(
        &self,
        build: &Build,
        project_name: &str,
        notifier: &dyn Notifier,
        webhook: Option<(&str, &str)>,
        ctx_urls: impl Fn(&str) -> RunContext<'cu>,
    ) -> Result<()> {
        let Some(trigger_name) = build.trigger_name.clone() else {
            return Ok(());
        };
        let project_def = self.load_project_definition(project_name, build.build_id).await?;
        let trigger = project_def
            .get_trigger(&trigger_name)
            .ok_or_else(|| JobservError::NotFound(format!("trigger {trigger_name}")))?
            .clone();

        if let Some(email) = &trigger.email {
            notifier
                .notify_build_complete_email(build, &[email.clone()])
                .await?;
        }
        if let Some((url, secret)) = webhook {
            notifier.notify_build_complete_webhook(build, url, secret).await?;
        }

        if build.status == Status::Passed {
            // §10: the Build-level fan-out's params carry only a truncated
            // Build URL under `H_TRIGGER_URL`, replacing (not merging with)
            // whatever env the completing Run carried — grounded on
            // `jobserv/api/run.py: _handle_build_complete`'s
            // `url[:url.find('/runs/') + 1]`.
            let mut build_env = BTreeMap::new();
            build_env.insert(
                "H_TRIGGER_URL".to_string(),
                Value::String(truncate_to_build_url(&ctx_urls("").run_url)),
            );
            for child in &trigger.triggers {
                self.instantiate_trigger(
                    &project_def,
                    build,
                    project_name,
                    &child.name,
                    &trigger.trigger_type,
                    &build_env,
                    &BTreeMap::new(),
                    child.run_names.as_deref(),
                    &ctx_urls,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Truncate a Run URL down to its Build: keep everything up to and
/// including the leading `/` of `/runs/...` (§10). Falls back to the
/// original URL unchanged if it carries no `/runs/` segment.
fn truncate_to_build_url(run_url: &str) -> String {
    match run_url.find("/runs/") {
        Some(idx) => run_url[..=idx].to_string(),
        None => run_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upgrades_simple_to_parent_type() {
        assert_eq!(upgrade_trigger_type("github_pr", "simple"), "github_pr");
        assert_eq!(upgrade_trigger_type("github_pr", "lava"), "lava_pr");
        assert_eq!(upgrade_trigger_type("gitlab_mr", "simple"), "gitlab_mr");
        assert_eq!(upgrade_trigger_type("gitlab_mr", "lava"), "lava_mr");
        assert_eq!(upgrade_trigger_type("git_poller", "simple"), "git_poller");
    }

    #[test]
    fn leaves_unrelated_types_alone() {
        assert_eq!(upgrade_trigger_type("simple", "simple"), "simple");
        assert_eq!(upgrade_trigger_type("github_pr", "git_poller"), "git_poller");
    }

    #[test]
    fn api_keys_are_32_chars_and_vary() {
        let a = random_api_key();
        let b = random_api_key();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn truncates_run_url_to_build_url() {
        assert_eq!(
            truncate_to_build_url("https://jobserv.example/projects/widgets/builds/3/runs/unit"),
            "https://jobserv.example/projects/widgets/builds/3/"
        );
    }

    #[test]
    fn truncation_is_a_no_op_without_a_runs_segment() {
        assert_eq!(truncate_to_build_url("https://jobserv.example/widgets/3"), "https://jobserv.example/widgets/3");
    }
}
