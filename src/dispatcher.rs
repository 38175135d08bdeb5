//! The queued-run dispatcher (§4.4): `pop_queued(worker) -> Run?`, the single
//! operation that must stay correct under unlimited concurrent pollers.
//! Grounded on `jobserv/api/worker.py`'s run-claiming query, reshaped
//! around an explicit ordered scan plus a single atomic conditional UPDATE
//! (`Store::claim_queued_run`) instead of a database-specific locking read.

use std::collections::{HashMap, HashSet};

use glob::Pattern;

use crate::error::Result;
use crate::status::Status;
use crate::store::models::{Run, Worker};
use crate::store::Store;

pub struct Dispatcher<'a> {
    store: &'a Store,
}

impl<'a> Dispatcher<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Find and atomically claim one QUEUED Run this worker may execute.
    /// `surging_tags` is the set of host tags whose surge flag is currently
    /// active (§4.7), needed to decide `surges_only` worker availability.
    pub async fn pop_queued(
        &self,
        worker: &Worker,
        surging_tags: &HashSet<String>,
    ) -> Result<Option<Run>> {
        if !worker.available(surging_tags) {
            return Ok(None);
        }

        let candidates = self.store.scan_dispatch_candidates().await?;
        let worker_idents: HashSet<String> = std::iter::once(worker.name.to_lowercase())
            .chain(worker.split_tags().into_iter().map(|t| t.to_lowercase()))
            .collect();

        let mut sync_projects: HashSet<i64> = HashSet::new();
        // Keyed by (project_id, build_seq): build_seq alone repeats across
        // projects, so project_id disambiguates.
        let mut okay_sync_builds: HashSet<(i64, i64)> = HashSet::new();

        for row in &candidates {
            match row.status {
                Status::Running => {
                    if row.synchronous_builds {
                        sync_projects.insert(row.project_id);
                        okay_sync_builds.insert((row.project_id, row.build_seq));
                    }
                    continue;
                }
                Status::Queued => {}
                _ => continue,
            }

            if !host_tag_matches(&row.host_tag, &worker_idents) {
                continue;
            }

            let blocked_by_sync = row.synchronous_builds
                && sync_projects.contains(&row.project_id)
                && !okay_sync_builds.contains(&(row.project_id, row.build_seq));
            if blocked_by_sync {
                continue;
            }

            if self.store.claim_queued_run(row.run_id, &worker.name).await? {
                return Ok(Some(self.store.get_run_by_id(row.run_id).await?));
            }
            // Lost the race to another poller; this worker's poll is done.
            return Ok(None);
        }

        Ok(None)
    }
}

fn host_tag_matches(host_tag: &str, worker_idents: &HashSet<String>) -> bool {
    match Pattern::new(&host_tag.to_lowercase()) {
        Ok(pattern) => worker_idents.iter().any(|id| pattern.matches(id)),
        Err(_) => worker_idents.contains(&host_tag.to_lowercase()),
    }
}

/// Counts per status across all QUEUED/RUNNING Runs, for the `/health/runs/`
/// surface (§6.C).
pub async fn status_counts(store: &Store) -> Result<HashMap<Status, i64>> {
    let mut by_status: HashMap<Status, i64> = HashMap::new();
    for row in store.scan_dispatch_candidates().await? {
        *by_status.entry(row.status).or_insert(0) += 1;
    }
    Ok(by_status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_worker_name_or_tag() {
        let mut idents = HashSet::new();
        idents.insert("amd64".to_string());
        idents.insert("w1".to_string());
        assert!(host_tag_matches("amd64", &idents));
        assert!(host_tag_matches("w1", &idents));
        assert!(!host_tag_matches("arm64", &idents));
        assert!(host_tag_matches("amd*", &idents));
    }
}
