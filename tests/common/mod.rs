//! Shared integration-test scaffolding: a fresh per-test SQLite file
//! (in-memory can't be shared across pool connections) and a local
//! filesystem artifact store rooted in a temp dir.

use jobserv_core::artifact_store::LocalArtifactStore;
use jobserv_core::store::Store;

pub async fn test_store(dir: &std::path::Path) -> Store {
    let db_path = dir.join("jobserv.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());
    Store::connect(&url).await.expect("connect test store")
}

pub fn test_artifacts(dir: &std::path::Path) -> LocalArtifactStore {
    LocalArtifactStore::new(dir.join("artifacts"))
}

pub const MINIMAL_PROJECT: &str = r#"
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

pub const CHAINED_PROJECT: &str = r#"
timeout: 30
scripts:
  build: "echo build"
  deploy: "echo deploy"
triggers:
  - name: git_poller
    type: git_poller
    runs:
      - name: build
        container: alpine
        host-tag: amd64
        script: build
        triggers:
          - name: deploy
  - name: deploy
    type: simple
    runs:
      - name: deploy
        container: alpine
        host-tag: amd64
        script: deploy
"#;
