//! The artifact store capability (§6.A) the core depends on but never
//! implements a specific backend for. `LocalArtifactStore` is a filesystem
//! implementation good enough for tests and single-node deployments;
//! production backends (S3, GCS, ...) implement the same trait out of tree.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{JobservError, Result};

/// Where a Run or Build's console/artifacts/rundef live relative to the
/// store root: `<project>/<build_id>/<run>/<rel>` for run artifacts,
/// `<project>/<build_id>/project.yml` for the definition,
/// `<project>/<build_id>/<run>/.rundef.json` for a Run's run-definition.
pub fn project_definition_path(project: &str, build_id: i64) -> String {
    format!("{project}/{build_id}/project.yml")
}

pub fn rundef_path(project: &str, build_id: i64, run: &str) -> String {
    format!("{project}/{build_id}/{run}/.rundef.json")
}

pub fn console_path(project: &str, build_id: i64, run: &str) -> String {
    format!("{project}/{build_id}/{run}/console.log")
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put_string(&self, path: &str, body: &str) -> Result<()>;
    async fn put_file(&self, path: &str, local: &Path, content_type: &str) -> Result<()>;
    async fn get_string(&self, path: &str) -> Result<String>;
    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>>;
    /// Relative paths beneath `prefix`, excluding any `.rundef.json`.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    /// A signed upload URL for `path`, valid for `expiration_s` seconds.
    async fn put_url(&self, path: &str, expiration_s: u64, content_type: &str) -> Result<String>;
    /// Console-open: a local, append-only handle for a Run's live log.
    async fn console_open(&self, project: &str, build_id: i64, run: &str) -> Result<PathBuf>;
    /// Console-finalize: copy the local console into the store and delete
    /// the local copy (§5: "Consoles are append-only until the Run is
    /// terminal; after terminal status, the log is copied ... and the local
    /// file deleted").
    async fn console_finalize(&self, project: &str, build_id: i64, run: &str) -> Result<()>;
    /// Scoped read-modify-write over the git-poller's opaque cache object.
    async fn git_poller_cache_get(&self) -> Result<BTreeMap<String, Value>>;
    async fn git_poller_cache_put(&self, cache: &BTreeMap<String, Value>) -> Result<()>;
}

pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn cache_path(&self) -> PathBuf {
        self.root.join(".git_poller_cache.json")
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put_string(&self, path: &str, body: &str) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        }
        fs::write(&full, body)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))
    }

    async fn put_file(&self, path: &str, local: &Path, _content_type: &str) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        }
        fs::copy(local, &full)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn get_string(&self, path: &str) -> Result<String> {
        fs::read_to_string(self.full_path(path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => JobservError::NotFound(path.to_string()),
                _ => JobservError::Unavailable(e.to_string()),
            })
    }

    async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => JobservError::NotFound(path.to_string()),
                _ => JobservError::Unavailable(e.to_string()),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let base = self.full_path(prefix);
        let mut out = Vec::new();
        let mut stack = vec![base.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(JobservError::Unavailable(e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?
            {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.file_name().and_then(|n| n.to_str()) != Some(".rundef.json") {
                    if let Ok(rel) = path.strip_prefix(&base) {
                        out.push(rel.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn put_url(&self, path: &str, expiration_s: u64, content_type: &str) -> Result<String> {
        // A local store has no signer; synthesize a URL carrying the same
        // information a real cloud-signed URL would.
        Ok(format!(
            "file://{}?expires_in={expiration_s}&content_type={content_type}",
            self.full_path(path).display()
        ))
    }

    async fn console_open(&self, project: &str, build_id: i64, run: &str) -> Result<PathBuf> {
        let path = console_path(project, build_id, run);
        let full = self.full_path(&path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        }
        if fs::metadata(&full).await.is_err() {
            fs::File::create(&full)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        }
        Ok(full)
    }

    async fn console_finalize(&self, project: &str, build_id: i64, run: &str) -> Result<()> {
        let path = console_path(project, build_id, run);
        let full = self.full_path(&path);
        if fs::metadata(&full).await.is_ok() {
            let contents = fs::read(&full)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
            let mut f = fs::File::create(&full)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
            f.write_all(&contents)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
            fs::remove_file(&full)
                .await
                .map_err(|e| JobservError::Unavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn git_poller_cache_get(&self) -> Result<BTreeMap<String, Value>> {
        match fs::read_to_string(self.cache_path()).await {
            Ok(s) => serde_json::from_str(&s).map_err(|e| JobservError::Unexpected(e.into())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(JobservError::Unavailable(e.to_string())),
        }
    }

    async fn git_poller_cache_put(&self, cache: &BTreeMap<String, Value>) -> Result<()> {
        let body =
            serde_json::to_string_pretty(cache).map_err(|e| JobservError::Unexpected(e.into()))?;
        fs::write(self.cache_path(), body)
            .await
            .map_err(|e| JobservError::Unavailable(e.to_string()))
    }
}
