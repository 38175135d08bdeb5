//! Status aggregation and trigger fan-out under the per-Build lock (§4.5).
//! Owns the full five-step contract: acquire, write, recompute, fan out,
//! release — so a Run update either runs to completion inside one lock hold
//! or leaves no partial Build-visible state behind.

use std::path::Path;

use crate::artifact_store::ArtifactStore;
use crate::error::Result;
use crate::notify::Notifier;
use crate::pipeline::rundef::RunContext;
use crate::status::{cumulative_status, Status};
use crate::store::build_lock::BuildLock;
use crate::store::models::Build;
use crate::store::Store;
use crate::trigger_engine::TriggerEngine;

/// Outcome of folding one Run status change into its Build.
pub struct AggregationResult {
    pub build: Build,
    pub build_status_changed: bool,
    pub run_became_terminal: bool,
}

/// Webhook delivery parameters for a Build-complete notification, resolved
/// by the caller from the trigger's secrets (the aggregator has no opinion
/// on where they come from).
pub struct WebhookPolicy<'a> {
    pub url: &'a str,
    pub hmac_secret: &'a str,
}

/// Apply a Run's new status end to end (§4.5 steps 1-5): acquire the Build
/// lock, write the Run's status and event, recompute and persist the Build
/// status, run trigger fan-out if the Run or Build just went terminal, then
/// release the lock.
#[allow(clippy::too_many_arguments)]
pub async fn process_run_status_change<'cu>(
    store: &Store,
    state_dir: &Path,
    artifacts: &dyn ArtifactStore,
    notifier: &dyn Notifier,
    project_name: &str,
    run_id: i64,
    new_status: Status,
    webhook: Option<WebhookPolicy<'_>>,
    ctx_urls: impl Fn(&str) -> RunContext<'cu>,
) -> Result<AggregationResult> {
    let run = store.get_run_by_id(run_id).await?;
    let build = store.get_build_by_id(run.build_id).await?;

    let lock = BuildLock::acquire(state_dir, build.id)?;

    store.set_run_status(run_id, new_status).await?;
    store.append_run_event(run_id, new_status).await?;

    let runs = store.list_runs_for_build(build.id).await?;
    let recomputed = cumulative_status(runs.iter().map(|r| r.status));

    let build_status_changed = recomputed != build.status;
    if build_status_changed {
        store.set_build_status(build.id, recomputed).await?;
        store.append_build_event(build.id, recomputed).await?;
    }

    let engine = TriggerEngine::new(store, artifacts);
    let run = store.get_run_by_id(run_id).await?;
    let mut build_snapshot = store.get_build_by_id(build.id).await?;
    build_snapshot.status = recomputed;

    if new_status.is_terminal() {
        engine
            .on_run_terminal(&build_snapshot, project_name, &run, &ctx_urls)
            .await?;
    }
    if recomputed.is_terminal() {
        let webhook_tuple = webhook.as_ref().map(|w| (w.url, w.hmac_secret));
        engine
            .on_build_terminal(&build_snapshot, project_name, notifier, webhook_tuple, &ctx_urls)
            .await?;
    }

    if recomputed.is_terminal() {
        lock.reclaim()?;
    } else {
        drop(lock);
    }

    let refreshed = store.get_build_by_id(build.id).await?;
    Ok(AggregationResult {
        build: refreshed,
        build_status_changed,
        run_became_terminal: new_status.is_terminal(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_completion_is_detected_by_terminality() {
        // cumulative_status itself is exercised in status.rs; here we only
        // assert the terminal/non-terminal classification this module
        // relies on to decide whether to reclaim the Build lock.
        assert!(Status::Passed.is_terminal());
        assert!(!Status::Running.is_terminal());
    }
}
