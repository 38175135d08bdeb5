//! Run-update ingress (§4.6): the authenticated surface a Run-in-progress
//! calls to append log output, set metadata, change status (with
//! test-grepping escalation), and request signed upload URLs. Grounded on
//! `jobserv/api/run.py`'s `run_update`/`_failed_tests`/`_authenticate_runner`.

use std::collections::BTreeMap;
use std::path::Path;

use regex::Regex;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tokio::io::AsyncWriteExt;

use crate::aggregator::{process_run_status_change, WebhookPolicy};
use crate::artifact_store::{console_path, rundef_path, ArtifactStore};
use crate::error::{JobservError, Result};
use crate::notify::Notifier;
use crate::pipeline::rundef::RunContext;
use crate::status::Status;
use crate::store::models::Run;
use crate::store::Store;

/// Constant-time token comparison (§4.6: "both compared using constant-time
/// equality"). Differing lengths short-circuit: the token length itself is
/// not secret.
fn tokens_equal(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Authenticate a Run-in-progress request by its per-Run `api_key`, either
/// via `apikey=` query arg or `Authorization: Token <key>` header.
pub fn authenticate(run: &Run, apikey_query: Option<&str>, auth_header: Option<&str>) -> Result<()> {
    if let Some(key) = apikey_query {
        if tokens_equal(key, &run.api_key) {
            return Ok(());
        }
    }
    let header = auth_header
        .ok_or_else(|| JobservError::AuthRequired("no apikey or Authorization header provided".into()))?;
    let mut parts = header.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("");
    let token = parts.next();
    if scheme != "Token" || token.is_none() {
        return Err(JobservError::AuthInvalid("invalid Authorization header".into()));
    }
    if !tokens_equal(token.unwrap(), &run.api_key) {
        return Err(JobservError::AuthInvalid("incorrect api key".into()));
    }
    if run.status.is_terminal() {
        return Err(JobservError::AuthInvalid("run has already completed".into()));
    }
    Ok(())
}

pub struct Ingress<'a> {
    store: &'a Store,
    artifacts: &'a dyn ArtifactStore,
}

impl<'a> Ingress<'a> {
    pub fn new(store: &'a Store, artifacts: &'a dyn ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    /// Append-log (default operation): request body goes on the end of the
    /// Run's active console.
    pub async fn append_log(&self, project: &str, build_id: i64, run: &Run, body: &[u8]) -> Result<()> {
        if body.is_empty() {
            return Ok(());
        }
        let path = self.artifacts.console_open(project, build_id, &run.name).await?;
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        f.write_all(body)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))
    }

    /// Set-metadata (header-driven): store an opaque string on the Run.
    pub async fn set_metadata(&self, run_id: i64, metadata: &str) -> Result<()> {
        self.store.set_run_meta(run_id, metadata).await
    }

    /// Request-signed-urls: a put-URL and expected content-type per
    /// requested artifact path.
    pub async fn request_signed_urls(
        &self,
        project: &str,
        build_id: i64,
        run_name: &str,
        paths: &[String],
        expiration_s: u64,
    ) -> Result<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for rel in paths {
            let full = format!("{project}/{build_id}/{run_name}/{rel}");
            let content_type = content_type_for(rel);
            let url = self.artifacts.put_url(&full, expiration_s, content_type).await?;
            out.insert(rel.clone(), url);
        }
        Ok(out)
    }

    /// Test-grepping escalation (§4.6): run the Run's stored rules over its
    /// final console log, synthesizing Test/TestResult rows. Returns
    /// `true` iff any result was FAILED (the Run must then be downgraded).
    pub async fn grep_tests(&self, project: &str, build_id: i64, run: &Run) -> Result<bool> {
        let rundef_str = self
            .artifacts
            .get_string(&rundef_path(project, build_id, &run.name))
            .await?;
        let rundef: Value = serde_json::from_str(&rundef_str).map_err(|e| JobservError::Unexpected(e.into()))?;
        let Some(grepping) = rundef.get("test-grepping").filter(|v| !v.is_null()) else {
            return Ok(false);
        };

        let test_pattern = grepping
            .get("test-pattern")
            .and_then(Value::as_str)
            .map(Regex::new)
            .transpose()
            .map_err(|e| JobservError::Unexpected(e.into()))?;
        let result_pattern_raw = grepping
            .get("result-pattern")
            .and_then(Value::as_str)
            .ok_or_else(|| JobservError::Unexpected(anyhow::anyhow!("test-grepping missing result-pattern")))?;
        let result_pattern =
            Regex::new(result_pattern_raw).map_err(|e| JobservError::Unexpected(e.into()))?;
        let fixups: BTreeMap<String, String> = grepping
            .get("fixupdict")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let console = self
            .artifacts
            .get_string(&console_path(project, build_id, &run.name))
            .await
            .unwrap_or_default();

        let mut failures = false;
        let mut cur_test_id: Option<i64> = None;
        let mut cur_test_had_failure = false;

        for line in console.lines() {
            if let Some(pat) = &test_pattern {
                if let Some(caps) = pat.captures(line) {
                    if let (Some(id), true) = (cur_test_id, cur_test_had_failure) {
                        self.store.set_test_status(id, Status::Failed).await?;
                    }
                    let name = caps.name("name").map(|m| m.as_str()).unwrap_or(line);
                    let test = self
                        .store
                        .create_test(run.id, name, Some(result_pattern_raw))
                        .await?;
                    cur_test_id = Some(test.id);
                    cur_test_had_failure = false;
                }
            }
            if let Some(caps) = result_pattern.captures(line) {
                let raw_result = caps.name("result").map(|m| m.as_str()).unwrap_or("");
                let result = fixups.get(raw_result).map(String::as_str).unwrap_or(raw_result);
                let status: Status = result.parse().unwrap_or(Status::Passed);
                if status == Status::Failed {
                    failures = true;
                    cur_test_had_failure = true;
                }
                let test_id = match cur_test_id {
                    Some(id) => id,
                    None => {
                        let test = self.store.create_test(run.id, "default", None).await?;
                        cur_test_id = Some(test.id);
                        test.id
                    }
                };
                let name = caps.name("name").map(|m| m.as_str()).unwrap_or(line);
                self.store
                    .create_test_result(test_id, name, None, status, None)
                    .await?;
            }
        }
        if let (Some(id), true) = (cur_test_id, cur_test_had_failure) {
            self.store.set_test_status(id, Status::Failed).await?;
        }
        Ok(failures)
    }

    /// Set-status (header-driven): the full §4.6 flow. On transition to
    /// PASSED/FAILED, run test-grepping (which may downgrade to FAILED),
    /// coerce to RUNNING if any attached Test is still incomplete, finalize
    /// the console, then fold the result through the aggregator/trigger
    /// engine under the Build lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_status<'cu>(
        &self,
        state_dir: &Path,
        notifier: &dyn Notifier,
        project: &str,
        build_id: i64,
        run: &Run,
        mut new_status: Status,
        webhook: Option<WebhookPolicy<'_>>,
        ctx_urls: impl Fn(&str) -> RunContext<'cu>,
    ) -> Result<()> {
        if new_status == run.status {
            return Ok(());
        }

        if matches!(new_status, Status::Passed | Status::Failed) {
            if self.grep_tests(project, build_id, run).await? {
                new_status = Status::Failed;
            }
            self.artifacts.console_finalize(project, build_id, &run.name).await?;

            let tests = self.store.list_tests_for_run(run.id).await?;
            let incomplete = tests.iter().any(|t| !t.status.is_terminal());
            if incomplete {
                new_status = Status::Running;
            }
        }

        process_run_status_change(
            self.store,
            state_dir,
            self.artifacts,
            notifier,
            project,
            run.id,
            new_status,
            webhook,
            ctx_urls,
        )
        .await?;
        Ok(())
    }

    /// Cooperative cancellation (§5): mark CANCELLING; the worker observes
    /// this on its next interaction and terminates the Run with FAILED.
    pub async fn cancel(&self, run_id: i64) -> Result<()> {
        self.store.set_run_status(run_id, Status::Cancelling).await?;
        self.store.append_run_event(run_id, Status::Cancelling).await
    }
}

fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain",
        Some("tar") => "application/x-tar",
        Some("gz") => "application/gzip",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}
