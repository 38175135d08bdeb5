//! Surge monitor against a real store: the queue-vs-capacity round robin
//! picks up true excess demand per host tag, and lifting a surge condition
//! respects the anti-flap hysteresis window (§4.7).

mod common;

use std::time::Duration;

use jobserv_core::notify::LoggingNotifier;
use jobserv_core::surge::SurgeMonitor;

#[tokio::test]
async fn queued_runs_past_worker_capacity_mark_the_tag_surging() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let state_dir = dir.path().join("worker-state");
    let notifier = LoggingNotifier;

    let project = store.create_project("widgets", false).await.unwrap();
    let build = store.create_build(project.id, None, None).await.unwrap();
    // One worker with support_ratio 1 means a single Run saturates it.
    for i in 0..3 {
        store
            .create_run(build.id, &format!("r{i}"), "key", None, "amd64", 0)
            .await
            .unwrap();
    }
    store
        .create_worker("w1", "debian", 8192, 4, "x86_64", 1, "amd64", "hash", false)
        .await
        .unwrap();
    store.set_worker_enlisted("w1", true).await.unwrap();
    store.set_worker_online("w1", true).await.unwrap();

    let monitor = SurgeMonitor::new(&store, &notifier, state_dir.clone(), 1, 1024 * 1024);
    let surging = monitor.check_queue().await.unwrap();
    assert!(surging.contains("amd64"));
    assert!(state_dir.join("enable_surge-amd64").exists());
}

#[tokio::test]
async fn worker_tags_are_matched_case_insensitively() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let state_dir = dir.path().join("worker-state");
    let notifier = LoggingNotifier;

    let project = store.create_project("widgets", false).await.unwrap();
    let build = store.create_build(project.id, None, None).await.unwrap();
    for i in 0..2 {
        store
            .create_run(build.id, &format!("r{i}"), "key", None, "amd64", 0)
            .await
            .unwrap();
    }
    // Registered with an uppercase tag; surge accounting must still see it
    // as the same capacity pool as the (lowercased) queued Run host tags,
    // or a case-sensitive mismatch would surge both runs despite a worker
    // with enough slots to cover them.
    store
        .create_worker("w1", "debian", 8192, 4, "x86_64", 2, "AMD64", "hash", false)
        .await
        .unwrap();
    store.set_worker_enlisted("w1", true).await.unwrap();
    store.set_worker_online("w1", true).await.unwrap();

    let monitor = SurgeMonitor::new(&store, &notifier, state_dir.clone(), 2, 1024 * 1024);
    let surging = monitor.check_queue().await.unwrap();
    assert!(!surging.contains("amd64"));
}

#[tokio::test]
async fn surge_ending_is_held_by_antiflap_hysteresis() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let state_dir = dir.path().join("worker-state");
    let notifier = LoggingNotifier;
    std::fs::create_dir_all(&state_dir).unwrap();

    let flag = state_dir.join("enable_surge-amd64");
    std::fs::write(&flag, "prior-notification-id").unwrap();

    // No queued runs now, but the flag is fresh: hysteresis must keep it.
    let monitor = SurgeMonitor::new(&store, &notifier, state_dir.clone(), 3, 1024 * 1024);
    let surging = monitor.check_queue().await.unwrap();
    assert!(!surging.contains("amd64"));
    assert!(flag.exists(), "anti-flap window should have kept the flag in place");

    // Backdate the flag past the hysteresis window and try again.
    let stale_mtime = std::time::SystemTime::now() - Duration::from_secs(301);
    let stale_spec = nix::sys::time::TimeSpec::new(
        stale_mtime
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64,
        0,
    );
    nix::sys::stat::utimensat(None, &flag, &stale_spec, &stale_spec, nix::sys::stat::UtimensatFlags::FollowSymlink)
        .unwrap();

    monitor.check_queue().await.unwrap();
    assert!(!flag.exists(), "stale flag past the anti-flap window should be cleared");
}

#[tokio::test]
async fn worker_with_stale_ping_log_is_marked_offline() {
    let dir = tempfile::tempdir().unwrap();
    let store = common::test_store(dir.path()).await;
    let state_dir = dir.path().join("worker-state");
    let notifier = LoggingNotifier;

    store
        .create_worker("w1", "debian", 8192, 4, "x86_64", 1, "amd64", "hash", false)
        .await
        .unwrap();
    store.set_worker_enlisted("w1", true).await.unwrap();
    store.set_worker_online("w1", true).await.unwrap();

    let ping_dir = state_dir.join("w1");
    std::fs::create_dir_all(&ping_dir).unwrap();
    let ping_path = ping_dir.join("pings.log");
    std::fs::write(&ping_path, b"ping\n").unwrap();
    let stale_mtime = std::time::SystemTime::now() - Duration::from_secs(200);
    let stale_spec = nix::sys::time::TimeSpec::new(
        stale_mtime
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64,
        0,
    );
    nix::sys::stat::utimensat(
        None,
        &ping_path,
        &stale_spec,
        &stale_spec,
        nix::sys::stat::UtimensatFlags::FollowSymlink,
    )
    .unwrap();

    let monitor = SurgeMonitor::new(&store, &notifier, state_dir, 3, 1024 * 1024);
    monitor.check_workers().await.unwrap();

    let worker = store.get_worker("w1").await.unwrap();
    assert!(!worker.online);
}
