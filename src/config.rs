use std::path::{Path, PathBuf};
use std::{fs, time::Duration};

use anyhow::Context as _;
use serde::Deserialize;

/// Top level configuration, loaded from a TOML file the way the teacher's
/// pipeline config is loaded (see the old `manager_builder`): read the file,
/// `toml::from_str`, `deny_unknown_fields` catches typos early.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// `sqlx` connection string, e.g. `sqlite://jobserv.db`.
    pub database_url: String,
    /// Root directory for the local-filesystem artifact store (§6.A).
    pub artifact_root: PathBuf,
    /// Directory holding per-worker ping logs and per-Build lock files
    /// and per-tag surge flag files (§4.2, §4.7).
    pub worker_state_dir: PathBuf,
    /// Base64 or raw 32-byte key material for the secret vault (§2).
    pub vault_key: String,
    #[serde(default = "default_surge_cadence_s")]
    pub surge_cadence_s: u64,
    #[serde(default = "default_surge_support_ratio")]
    pub surge_support_ratio: usize,
    #[serde(default = "default_offline_threshold_s")]
    pub worker_offline_threshold_s: u64,
    #[serde(default = "default_surges_only_offline_threshold_s")]
    pub surges_only_offline_threshold_s: u64,
    #[serde(default = "default_surge_antiflap_s")]
    pub surge_antiflap_s: u64,
    #[serde(default = "default_ping_log_max_bytes")]
    pub ping_log_max_bytes: u64,
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_surge_cadence_s() -> u64 {
    120
}
fn default_surge_support_ratio() -> usize {
    3
}
fn default_offline_threshold_s() -> u64 {
    80
}
fn default_surges_only_offline_threshold_s() -> u64 {
    120
}
fn default_surge_antiflap_s() -> u64 {
    300
}
fn default_ping_log_max_bytes() -> u64 {
    1024 * 1024
}
fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path).context("couldn't read config")?;
        let config: Config = toml::from_str(&content).context("couldn't parse config")?;
        Ok(config)
    }

    pub fn surge_cadence(&self) -> Duration {
        Duration::from_secs(self.surge_cadence_s)
    }

    pub fn worker_offline_threshold(&self) -> Duration {
        Duration::from_secs(self.worker_offline_threshold_s)
    }

    pub fn surges_only_offline_threshold(&self) -> Duration {
        Duration::from_secs(self.surges_only_offline_threshold_s)
    }

    pub fn surge_antiflap(&self) -> Duration {
        Duration::from_secs(self.surge_antiflap_s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobserv.toml");
        fs::write(
            &path,
            r#"
            database_url = "sqlite::memory:"
            artifact_root = "/tmp/artifacts"
            worker_state_dir = "/tmp/worker-state"
            vault_key = "0123456789abcdef0123456789abcdef"
            "#,
        )
        .unwrap();
        let config = Config::load(&path).expect("should parse");
        assert_eq!(config.surge_cadence_s, 120);
        assert_eq!(config.surge_support_ratio, 3);
    }

    #[test]
    fn rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobserv.toml");
        fs::write(
            &path,
            r#"
            database_url = "sqlite::memory:"
            artifact_root = "/tmp/artifacts"
            worker_state_dir = "/tmp/worker-state"
            vault_key = "k"
            bogus = true
            "#,
        )
        .unwrap();
        assert!(Config::load(&path).is_err());
    }
}
