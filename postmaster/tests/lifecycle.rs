//! End-to-end lifecycle tests against real PostgreSQL binaries.
//!
//! Ignored by default; run with `pg_ctl`, `postgres` and `pg_isready` on
//! PATH: `cargo test -p pgwarden-postmaster -- --ignored`.

use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use pgwarden_core::{PgConfig, RetryPolicy, Role, StopMode};
use pgwarden_postmaster::Postmaster;

fn test_postmaster(data: &TempDir, extra: &TempDir, port: u16) -> Postmaster {
    let config = PgConfig {
        data_dir: data.path().join("pgdata"),
        extra_dir: extra.path().to_path_buf(),
        admin_username: "postgres".into(),
        admin_password: "test-password".into(),
        replication_username: "replicator".into(),
        replication_password: "repl-password".into(),
        hostname: "localhost".into(),
        port,
    };
    std::fs::write(
        config.template_path(),
        format!("port = {}\nlisten_addresses = '*'\n", port),
    )
    .unwrap();
    Postmaster::new(config, "itest-instance", CancellationToken::new()).with_retry_policies(
        RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(2)),
        RetryPolicy::new(15, Duration::from_millis(500), Duration::from_secs(2)),
    )
}

#[tokio::test]
#[ignore = "requires PostgreSQL binaries on PATH"]
async fn test_init_start_probe_stop_cycle() {
    let data = TempDir::new().unwrap();
    let extra = TempDir::new().unwrap();
    let pm = test_postmaster(&data, &extra, 55432);

    assert!(!pm.is_running().await);

    pm.init().await.unwrap();
    assert!(!pm.is_data_dir_empty().await.unwrap());
    // Password file must be gone after a successful init.
    assert!(!pm.config().password_file_path().exists());

    pm.write_configs(Role::Leader, None).unwrap();
    pm.start().await.unwrap();
    assert!(pm.is_running().await);
    assert!(!pm.is_in_recovery().await.unwrap());

    // Idempotent start.
    pm.start().await.unwrap();

    pm.stop(StopMode::Fast).await.unwrap();
    assert!(!pm.is_running().await);
}

#[tokio::test]
#[ignore = "requires PostgreSQL binaries on PATH"]
async fn test_init_refuses_populated_dir() {
    let data = TempDir::new().unwrap();
    let extra = TempDir::new().unwrap();
    let pm = test_postmaster(&data, &extra, 55433);

    pm.init().await.unwrap();
    let err = pm.init().await.unwrap_err();
    assert!(matches!(
        err,
        pgwarden_postmaster::PostmasterError::AlreadyInitialized
    ));
}

#[tokio::test]
#[ignore = "requires PostgreSQL binaries on PATH"]
async fn test_wipe_after_clean_stop() {
    let data = TempDir::new().unwrap();
    let extra = TempDir::new().unwrap();
    let pm = test_postmaster(&data, &extra, 55434);

    pm.init().await.unwrap();
    pm.write_configs(Role::Leader, None).unwrap();
    pm.start().await.unwrap();
    pm.stop(StopMode::Fast).await.unwrap();

    pm.empty_data_dir().await.unwrap();
    assert!(pm.is_data_dir_empty().await.unwrap());
}
