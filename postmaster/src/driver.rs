use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use pgwarden_core::{Fault, PgConfig, PostgresControl, RecoveryProbe, RetryPolicy, Role, StopMode};

use crate::pool::PgPools;
use crate::{PostmasterError, PostmasterResult};

const LOCALHOST: &str = "localhost";

/// How long a stop may take before we escalate to SIGKILL.
const STOP_TIMEOUT_SECS: u64 = 30;
/// Grace beyond pg_ctl's own -t before we give up waiting on it.
const STOP_ESCALATION_GRACE: Duration = Duration::from_secs(5);

/// Driver for the local PostgreSQL server.
///
/// Owns the data directory, the recorded server PID, and the per-host
/// connection pools. All mutation of the local server goes through here;
/// the daemon only sees the [`PostgresControl`] capability.
pub struct Postmaster {
    config: PgConfig,
    instance_id: String,
    pools: PgPools,
    backup_retry: RetryPolicy,
    readiness_retry: RetryPolicy,
    /// PID of the postgres child we spawned, if any. Compared against
    /// `postmaster.pid` before anything destructive.
    child_pid: Mutex<Option<u32>>,
    cancel: CancellationToken,
}

impl Postmaster {
    pub fn new(config: PgConfig, instance_id: impl Into<String>, cancel: CancellationToken) -> Self {
        let pools = PgPools::new(
            config.admin_username.clone(),
            config.admin_password.clone(),
            config.port,
        );
        Self {
            config,
            instance_id: instance_id.into(),
            pools,
            backup_retry: RetryPolicy::base_backup(),
            readiness_retry: RetryPolicy::readiness(),
            child_pid: Mutex::new(None),
            cancel,
        }
    }

    /// Override the retry policies (tests, unusual deployments).
    pub fn with_retry_policies(mut self, backup: RetryPolicy, readiness: RetryPolicy) -> Self {
        self.backup_retry = backup;
        self.readiness_retry = readiness;
        self
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    /// Run a bounded external tool to completion. The pg_ctl family limits
    /// itself via `-t`/`-w`, and stop must still work after the supervisor
    /// token is cancelled, so these are not tied to it.
    async fn run_tool(
        &self,
        tool: &'static str,
        mut cmd: Command,
    ) -> PostmasterResult<std::process::Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .map_err(|e| PostmasterError::external(tool, e.to_string()))?;
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| PostmasterError::external(tool, e.to_string()))?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(PostmasterError::external(
                tool,
                format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ))
        }
    }

    /// Like [`Self::run_tool`] but for tools with no natural bound
    /// (base backups): cancellation terminates the child.
    async fn run_tool_cancellable(
        &self,
        tool: &'static str,
        mut cmd: Command,
    ) -> PostmasterResult<std::process::Output> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = cmd
            .spawn()
            .map_err(|e| PostmasterError::external(tool, e.to_string()))?;
        let pid = child.id();

        let output_fut = child.wait_with_output();
        tokio::pin!(output_fut);

        tokio::select! {
            _ = self.cancel.cancelled() => {
                if let Some(pid) = pid {
                    let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                }
                let _ = (&mut output_fut).await;
                Err(PostmasterError::external(tool, "cancelled"))
            }
            output = &mut output_fut => {
                let output = output.map_err(|e| PostmasterError::external(tool, e.to_string()))?;
                if output.status.success() {
                    Ok(output)
                } else {
                    Err(PostmasterError::external(
                        tool,
                        format!(
                            "{}: {}",
                            output.status,
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    ))
                }
            }
        }
    }

    /// Readiness probe; `host` defaults to the local server.
    async fn is_ready(&self, host: Option<&str>) -> bool {
        let mut cmd = Command::new("pg_isready");
        cmd.arg("-p").arg(self.config.port.to_string());
        if let Some(host) = host {
            cmd.arg("-h").arg(host);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match tokio::time::timeout(Duration::from_secs(5), cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!("pg_isready could not run: {}", e);
                false
            }
            Err(_) => false,
        }
    }

    /// Run init-db once against an empty data directory. The admin password
    /// goes through a temp file that is deleted after success.
    pub async fn init(&self) -> PostmasterResult<()> {
        if !self.is_data_dir_empty().await? {
            return Err(PostmasterError::AlreadyInitialized);
        }

        let pw_path = self.config.password_file_path();
        if let Some(dir) = pw_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&pw_path, &self.config.admin_password)?;
        std::fs::set_permissions(&pw_path, std::fs::Permissions::from_mode(0o700))?;

        let mut cmd = Command::new("pg_ctl");
        cmd.arg("initdb")
            .arg("-D")
            .arg(&self.config.data_dir)
            .arg("-o")
            .arg(format!(
                "--username={} --pwfile={} --auth=scram-sha-256",
                self.config.admin_username,
                pw_path.display()
            ));
        self.run_tool("pg_ctl initdb", cmd).await?;

        std::fs::remove_file(&pw_path)?;
        tracing::info!(data_dir = %self.config.data_dir.display(), "data directory initialised");
        Ok(())
    }

    /// Start the server detached and wait until it answers readiness
    /// probes. Idempotent: a running server is left alone.
    pub async fn start(&self) -> PostmasterResult<()> {
        if self.is_running().await {
            tracing::debug!("start requested but server already running");
            return Ok(());
        }

        let mut cmd = Command::new("postgres");
        cmd.arg("-D")
            .arg(&self.config.data_dir)
            .arg("-h")
            .arg("*")
            .arg(format!("--hba_file={}", self.config.hba_path().display()))
            .stdin(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| PostmasterError::StartFailed(format!("spawn postgres: {}", e)))?;
        *self.child_pid.lock().unwrap() = child.id();
        tracing::info!(pid = ?child.id(), "postgres launched");

        // Reap in the background; the server outlives this call.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!("postgres exited: {}", status),
                Err(e) => tracing::warn!("postgres wait failed: {}", e),
            }
        });

        self.readiness_retry
            .run(&self.cancel, || async {
                if self.is_ready(None).await {
                    Ok(())
                } else {
                    Err(PostmasterError::StartFailed("not ready yet".into()))
                }
            })
            .await
            .map_err(|_| {
                PostmasterError::StartFailed("server did not become ready in time".into())
            })?;

        tracing::info!("postgres ready");
        Ok(())
    }

    /// Stop the server, escalating to SIGKILL when `pg_ctl stop` does not
    /// finish within the stop timeout. A stopped server is a no-op.
    pub async fn stop(&self, mode: StopMode) -> PostmasterResult<()> {
        if !self.is_running().await {
            tracing::debug!("stop requested but server not running");
            return Ok(());
        }
        tracing::info!(mode = mode.as_str(), "stopping postgres");

        let mut cmd = Command::new("pg_ctl");
        cmd.arg("stop")
            .arg("-D")
            .arg(&self.config.data_dir)
            .arg("-m")
            .arg(mode.as_str())
            .arg("-t")
            .arg(STOP_TIMEOUT_SECS.to_string())
            .arg("-w");

        let deadline = Duration::from_secs(STOP_TIMEOUT_SECS) + STOP_ESCALATION_GRACE;
        let stopped = match tokio::time::timeout(deadline, self.run_tool("pg_ctl stop", cmd)).await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::warn!("pg_ctl stop failed: {}, escalating", e);
                false
            }
            Err(_) => {
                tracing::warn!("pg_ctl stop timed out, escalating");
                false
            }
        };

        if !stopped {
            self.kill_server().await?;
        }

        *self.child_pid.lock().unwrap() = None;
        self.pools.discard(LOCALHOST).await;
        tracing::info!("postgres stopped");
        Ok(())
    }

    /// OS-level escalation: SIGKILL the recorded (or PID-file) process and
    /// wait for the port to go quiet.
    async fn kill_server(&self) -> PostmasterResult<()> {
        let pid = {
            let recorded = *self.child_pid.lock().unwrap();
            recorded.or_else(|| self.read_pid_file())
        };

        if let Some(pid) = pid {
            tracing::warn!(pid, "sending SIGKILL to postgres");
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        }

        for _ in 0..10 {
            if !self.is_running().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(PostmasterError::StopFailed(
            "server still answers after SIGKILL".into(),
        ))
    }

    /// Readiness of the local server. Unreachable means not running.
    pub async fn is_running(&self) -> bool {
        self.is_ready(None).await
    }

    /// `SELECT pg_is_in_recovery()` against the local server.
    pub async fn is_in_recovery(&self) -> PostmasterResult<bool> {
        let pool = self.pools.get(LOCALHOST).await?;
        let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
            .fetch_one(&pool)
            .await?;
        Ok(in_recovery)
    }

    /// Pooled admin connection to `host`; the cached pool is recycled when
    /// its ping succeeds.
    pub async fn connect_to(&self, host: &str) -> PostmasterResult<sqlx::PgPool> {
        Ok(self.pools.get(host).await?)
    }

    /// Orphan-probe a peer. A refused connection means the peer is down,
    /// which is not an error; a failed query after connecting is.
    pub async fn peer_status(&self, host: &str) -> PostmasterResult<pgwarden_core::PeerStatus> {
        use pgwarden_core::PeerStatus;

        let pool = match self.pools.get(host).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::debug!(host, "peer unreachable: {}", e);
                return Ok(PeerStatus::Unreachable);
            }
        };
        let in_recovery: bool = sqlx::query_scalar("SELECT pg_is_in_recovery()")
            .fetch_one(&pool)
            .await?;
        Ok(if in_recovery {
            PeerStatus::InRecovery
        } else {
            PeerStatus::Writable
        })
    }

    /// Tell the server to leave recovery.
    pub async fn promote(&self) -> PostmasterResult<()> {
        let mut cmd = Command::new("pg_ctl");
        cmd.arg("promote").arg("-D").arg(&self.config.data_dir).arg("-w");
        self.run_tool("pg_ctl promote", cmd)
            .await
            .map_err(|e| PostmasterError::PromoteFailed(e.to_string()))?;
        // The promoted server is writable; cached replica connections are
        // stale for role checks.
        self.pools.discard(LOCALHOST).await;
        tracing::info!("postgres promoted");
        Ok(())
    }

    pub async fn is_data_dir_empty(&self) -> PostmasterResult<bool> {
        match std::fs::read_dir(&self.config.data_dir) {
            Ok(mut entries) => Ok(entries.next().is_none()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn read_pid_file(&self) -> Option<u32> {
        let contents = std::fs::read_to_string(self.config.pid_file_path()).ok()?;
        parse_pid_file(&contents)
    }

    /// Delete every entry in the data directory.
    ///
    /// Refuses while the server answers probes, while `postmaster.pid`
    /// names a process that is still alive, or when the PID file disagrees
    /// with the PID we recorded at start.
    pub async fn empty_data_dir(&self) -> PostmasterResult<()> {
        if self.is_running().await {
            return Err(PostmasterError::refused(
                "server is running, will not wipe its data directory",
            ));
        }

        if let Some(file_pid) = self.read_pid_file() {
            let recorded = *self.child_pid.lock().unwrap();
            if let Some(recorded) = recorded {
                if recorded != file_pid {
                    return Err(PostmasterError::refused(format!(
                        "postmaster.pid names {} but we started {}",
                        file_pid, recorded
                    )));
                }
            }
            if pid_alive(file_pid) {
                return Err(PostmasterError::refused(format!(
                    "postmaster.pid names live process {}",
                    file_pid
                )));
            }
        }

        let entries = match std::fs::read_dir(&self.config.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(&path)?;
            } else {
                std::fs::remove_file(&path)?;
            }
        }
        tracing::info!(data_dir = %self.config.data_dir.display(), "data directory wiped");
        Ok(())
    }

    /// Stream a base backup from the leader into the data directory.
    /// Retried internally with the backup policy; partial attempts are
    /// wiped before the next try. On success the directory is restricted
    /// to 0700 as PostgreSQL requires.
    pub async fn make_base_backup(&self, leader_host: &str) -> PostmasterResult<()> {
        let result = self
            .backup_retry
            .run(&self.cancel, || async {
                if !self.is_data_dir_empty().await? {
                    self.empty_data_dir().await?;
                }
                self.run_base_backup_once(leader_host).await
            })
            .await;

        match result {
            Ok(()) => {
                std::fs::set_permissions(
                    &self.config.data_dir,
                    std::fs::Permissions::from_mode(0o700),
                )?;
                tracing::info!(leader = leader_host, "base backup complete");
                Ok(())
            }
            Err(e) => Err(PostmasterError::BackupFailed(e.to_string())),
        }
    }

    async fn run_base_backup_once(&self, leader_host: &str) -> PostmasterResult<()> {
        let mut cmd = Command::new("pg_basebackup");
        cmd.arg("-h")
            .arg(leader_host)
            .arg("-U")
            .arg(&self.config.replication_username)
            .arg("-p")
            .arg(self.config.port.to_string())
            .arg("-D")
            .arg(&self.config.data_dir)
            .arg("-Fp")
            .arg("-Xs")
            .arg("-P")
            .arg("-R")
            .env("PGPASSWORD", &self.config.replication_password);
        self.run_tool_cancellable("pg_basebackup", cmd).await?;
        Ok(())
    }

    /// Poll the leader's readiness until it accepts connections.
    pub async fn block_and_wait_for_leader(&self, leader_host: &str) -> PostmasterResult<()> {
        self.readiness_retry
            .run(&self.cancel, || async {
                if self.is_ready(Some(leader_host)).await {
                    Ok(())
                } else {
                    Err(PostmasterError::LeaderUnreachable(leader_host.to_string()))
                }
            })
            .await
    }

    /// Render and install both config files for `role`.
    pub fn write_configs(&self, role: Role, leader_host: Option<&str>) -> PostmasterResult<()> {
        self.config
            .write_postgresql_conf(role, leader_host, &self.instance_id)?;
        self.config.write_hba()?;
        tracing::debug!(role = %role, "config files written");
        Ok(())
    }

    /// Create the replication user and this instance's physical slot on a
    /// freshly bootstrapped leader. Idempotent.
    pub async fn setup_replication(&self) -> PostmasterResult<()> {
        let pool = self.pools.get(LOCALHOST).await?;

        let user_exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM pg_roles WHERE rolname = $1)")
                .bind(&self.config.replication_username)
                .fetch_one(&pool)
                .await?;
        if !user_exists {
            sqlx::query(&format!(
                "CREATE USER {} WITH REPLICATION ENCRYPTED PASSWORD '{}'",
                self.config.replication_username, self.config.replication_password
            ))
            .execute(&pool)
            .await?;
            tracing::info!(user = %self.config.replication_username, "replication user created");
        }

        self.create_replication_slot(LOCALHOST, &self.instance_id)
            .await
    }

    /// Ensure a physical replication slot exists on `host`. Idempotent.
    pub async fn create_replication_slot(
        &self,
        host: &str,
        slot_name: &str,
    ) -> PostmasterResult<()> {
        let pool = self.pools.get(host).await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pg_replication_slots WHERE slot_name = $1)",
        )
        .bind(slot_name)
        .fetch_one(&pool)
        .await?;
        if !exists {
            sqlx::query("SELECT pg_create_physical_replication_slot($1)")
                .bind(slot_name)
                .execute(&pool)
                .await?;
            tracing::info!(slot = slot_name, host, "replication slot created");
        }
        Ok(())
    }

    fn classify(e: PostmasterError) -> Fault {
        match e {
            PostmasterError::RefusedUnsafe(msg) => Fault::unsafe_refusal(msg),
            PostmasterError::AlreadyInitialized => {
                Fault::unsafe_refusal("data directory already initialised")
            }
            PostmasterError::Io(e) => Fault::fatal(format!("data directory io: {}", e)),
            PostmasterError::Config(e) => Fault::fatal(format!("config render: {}", e)),
            other => Fault::transient(other.to_string()),
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// First line of `postmaster.pid` is the server PID. Values that do not
/// fit a signal-able pid are treated as absent rather than cast blindly.
fn parse_pid_file(contents: &str) -> Option<u32> {
    let pid: u32 = contents.lines().next()?.trim().parse().ok()?;
    if pid == 0 || pid > i32::MAX as u32 {
        return None;
    }
    Some(pid)
}

#[async_trait]
impl RecoveryProbe for Postmaster {
    async fn is_running(&self) -> bool {
        Postmaster::is_running(self).await
    }

    async fn is_in_recovery(&self) -> Result<bool, Fault> {
        Postmaster::is_in_recovery(self).await.map_err(Self::classify)
    }
}

#[async_trait]
impl PostgresControl for Postmaster {
    async fn init(&self) -> Result<(), Fault> {
        Postmaster::init(self).await.map_err(Self::classify)
    }

    async fn start(&self) -> Result<(), Fault> {
        Postmaster::start(self).await.map_err(Self::classify)
    }

    async fn stop(&self, mode: StopMode) -> Result<(), Fault> {
        Postmaster::stop(self, mode).await.map_err(Self::classify)
    }

    async fn promote(&self) -> Result<(), Fault> {
        Postmaster::promote(self).await.map_err(Self::classify)
    }

    async fn is_running(&self) -> bool {
        Postmaster::is_running(self).await
    }

    async fn is_in_recovery(&self) -> Result<bool, Fault> {
        Postmaster::is_in_recovery(self).await.map_err(Self::classify)
    }

    async fn is_data_dir_empty(&self) -> Result<bool, Fault> {
        Postmaster::is_data_dir_empty(self).await.map_err(Self::classify)
    }

    async fn empty_data_dir(&self) -> Result<(), Fault> {
        Postmaster::empty_data_dir(self).await.map_err(Self::classify)
    }

    async fn make_base_backup(&self, leader_host: &str) -> Result<(), Fault> {
        Postmaster::make_base_backup(self, leader_host)
            .await
            .map_err(Self::classify)
    }

    async fn block_and_wait_for_leader(&self, leader_host: &str) -> Result<(), Fault> {
        Postmaster::block_and_wait_for_leader(self, leader_host)
            .await
            .map_err(Self::classify)
    }

    async fn write_configs(&self, role: Role, leader_host: Option<&str>) -> Result<(), Fault> {
        Postmaster::write_configs(self, role, leader_host).map_err(Self::classify)
    }

    async fn setup_replication(&self) -> Result<(), Fault> {
        Postmaster::setup_replication(self).await.map_err(Self::classify)
    }

    async fn create_replication_slot(&self, host: &str, slot_name: &str) -> Result<(), Fault> {
        Postmaster::create_replication_slot(self, host, slot_name)
            .await
            .map_err(Self::classify)
    }

    async fn peer_status(&self, host: &str) -> Result<pgwarden_core::PeerStatus, Fault> {
        Postmaster::peer_status(self, host).await.map_err(Self::classify)
    }
}
