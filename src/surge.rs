//! The surge monitor (§4.7): worker liveness, queue-vs-capacity, and
//! anti-flap surge-flag transitions. Grounded on `jobserv/worker.py`'s
//! `_check_worker`/`_check_queue`, reshaped around the `ArtifactStore`-style
//! worker-state directory this crate already keeps Build locks in.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::error::{JobservError, Result};
use crate::notify::Notifier;
use crate::store::Store;

const DEFAULT_ONLINE_THRESHOLD_S: u64 = 80;
const SURGES_ONLY_OFFLINE_THRESHOLD_S: u64 = 120;
const ANTI_FLAP_S: u64 = 300;

pub struct SurgeMonitor<'a> {
    store: &'a Store,
    notifier: &'a dyn Notifier,
    state_dir: PathBuf,
    support_ratio: i64,
    ping_log_max_bytes: u64,
}

impl<'a> SurgeMonitor<'a> {
    pub fn new(
        store: &'a Store,
        notifier: &'a dyn Notifier,
        state_dir: impl Into<PathBuf>,
        support_ratio: i64,
        ping_log_max_bytes: u64,
    ) -> Self {
        Self {
            store,
            notifier,
            state_dir: state_dir.into(),
            support_ratio,
            ping_log_max_bytes,
        }
    }

    fn pings_log_path(&self, worker: &str) -> PathBuf {
        self.state_dir.join(worker).join("pings.log")
    }

    fn surge_flag_path(&self, tag: &str) -> PathBuf {
        self.state_dir.join(format!("enable_surge-{tag}"))
    }

    /// Worker liveness pass: mark stale enlisted workers offline, rotating
    /// any `pings.log` that's grown past the configured size threshold.
    pub async fn check_workers(&self) -> Result<()> {
        let workers = self.store.list_workers(false).await?;
        for worker in workers.into_iter().filter(|w| w.enlisted) {
            let path = self.pings_log_path(&worker.name);
            let threshold = if worker.surges_only {
                SURGES_ONLY_OFFLINE_THRESHOLD_S
            } else {
                DEFAULT_ONLINE_THRESHOLD_S
            };

            match std::fs::metadata(&path) {
                Ok(meta) => {
                    let age = meta
                        .modified()
                        .ok()
                        .and_then(|m| SystemTime::now().duration_since(m).ok())
                        .unwrap_or_default();
                    if age > Duration::from_secs(threshold) && worker.online {
                        self.store.set_worker_online(&worker.name, false).await?;
                    }
                    if meta.len() > self.ping_log_max_bytes {
                        rotate_ping_log(&path)?;
                    }
                }
                Err(_) => {
                    if worker.online {
                        self.store.set_worker_online(&worker.name, false).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Queue-vs-capacity pass: round-robin assign QUEUED runs to non-surge
    /// worker slots by host tag, then reconcile the surging set against the
    /// on-disk surge flags with anti-flap hysteresis.
    pub async fn check_queue(&self) -> Result<HashSet<String>> {
        let queued = self.store.list_queued_runs_by_host_tag().await?;
        let mut unclaimed: Vec<(i64, String, bool)> = queued
            .into_iter()
            .map(|(id, tag)| (id, tag, true))
            .collect();

        let workers = self.store.list_workers(false).await?;
        let mut slots: HashMap<String, (i64, Vec<String>)> = HashMap::new();
        for w in workers.into_iter().filter(|w| w.enlisted && w.online && !w.surges_only) {
            slots.insert(
                w.name.clone(),
                (self.support_ratio, w.split_tags()),
            );
        }

        let mut found = true;
        while found {
            found = false;
            let mut exhausted = Vec::new();
            for (name, (remaining, tags)) in slots.iter_mut() {
                if *remaining == 0 {
                    continue;
                }
                if let Some(run) = unclaimed.iter_mut().find(|(_, tag, open)| *open && tags.contains(tag)) {
                    run.2 = false;
                    *remaining -= 1;
                    found = true;
                    if *remaining == 0 {
                        exhausted.push(name.clone());
                    }
                }
            }
            for name in exhausted {
                slots.remove(&name);
            }
        }

        let mut surges: HashMap<String, i64> = HashMap::new();
        for (_, tag, open) in &unclaimed {
            if *open {
                *surges.entry(tag.clone()).or_insert(0) += 1;
            }
        }
        let surging_now: HashSet<String> = surges.keys().cloned().collect();

        let prev_surges = self.list_surge_flags()?;
        for tag in &prev_surges {
            if !surging_now.contains(tag) {
                let flag = self.surge_flag_path(tag);
                let within_antiflap = std::fs::metadata(&flag)
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|m| SystemTime::now().duration_since(m).ok())
                    .map(|age| age < Duration::from_secs(ANTI_FLAP_S))
                    .unwrap_or(false);
                if within_antiflap {
                    continue;
                }
                let prior_id = std::fs::read_to_string(&flag).unwrap_or_default();
                self.notifier.notify_surge_ended(tag, prior_id.trim()).await?;
                let _ = std::fs::remove_file(&flag);
            }
        }

        for (tag, _count) in &surges {
            let flag = self.surge_flag_path(tag);
            if !flag.exists() {
                let id = self.notifier.notify_surge_started(tag).await?;
                std::fs::create_dir_all(&self.state_dir)
                    .map_err(|e| JobservError::Unavailable(e.to_string()))?;
                std::fs::write(&flag, id).map_err(|e| JobservError::Unavailable(e.to_string()))?;
            }
        }

        Ok(surging_now)
    }

    fn list_surge_flags(&self) -> Result<HashSet<String>> {
        let prefix = "enable_surge-";
        let mut out = HashSet::new();
        let entries = match std::fs::read_dir(&self.state_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(JobservError::Unavailable(e.to_string())),
        };
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(tag) = name.strip_prefix(prefix) {
                    out.insert(tag.to_string());
                }
            }
        }
        Ok(out)
    }

    /// The set of host tags currently surging, per the on-disk flag files
    /// (§4.4 consults this for `surges_only` worker availability).
    pub fn surging_tags(&self) -> Result<HashSet<String>> {
        self.list_surge_flags()
    }
}

fn rotate_ping_log(path: &Path) -> Result<()> {
    let meta = std::fs::metadata(path).map_err(|e| JobservError::Unavailable(e.to_string()))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let rotated = path.with_extension(format!("log.{mtime}"));
    std::fs::rename(path, &rotated).map_err(|e| JobservError::Unavailable(e.to_string()))?;
    std::fs::File::create(path).map_err(|e| JobservError::Unavailable(e.to_string()))?;

    // Preserve the rotated-out mtime on the fresh file so a worker that was
    // already stale before rotation doesn't look freshly-alive afterwards.
    let spec = nix::sys::time::TimeSpec::new(mtime as i64, 0);
    nix::sys::stat::utimensat(
        None,
        path,
        &spec,
        &spec,
        nix::sys::stat::UtimensatFlags::FollowSymlink,
    )
    .map_err(|e| JobservError::Unavailable(e.to_string()))
}
