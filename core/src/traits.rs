use async_trait::async_trait;
use thiserror::Error;

use crate::{InstanceInfo, Role};

/// Fault classification surfaced across the capability seams.
///
/// The reconciliation daemon is the only recovery boundary: leaf crates map
/// their typed errors into one of these classes at the trait boundary, and
/// the daemon decides to defer (Transient), refuse-and-continue (Unsafe) or
/// abort the supervisor (Fatal).
#[derive(Debug, Error)]
pub enum Fault {
    /// Network blips, timeouts, peers still starting up. Retry next tick.
    #[error("temporarily unavailable: {0}")]
    Transient(String),

    /// Acting now could corrupt data or split the brain. Log and keep
    /// ticking; the operator or the cluster resolves the condition.
    #[error("refusing unsafe action: {0}")]
    Unsafe(String),

    /// Unrecoverable: data-dir IO failure, config render failure, corrupt
    /// consensus-store keys. The supervisor exits non-zero.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl Fault {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn unsafe_refusal(msg: impl Into<String>) -> Self {
        Self::Unsafe(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Outcome of asking the proxy what role this instance holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleAssessment {
    /// The consensus store answered; this is authoritative.
    Confirmed(Role),
    /// Store unreachable, but the local server is in recovery. A replica
    /// without a consensus store is harmless: converge normally.
    InferredReplica,
    /// Store unreachable and the local server is writable. We cannot prove
    /// we are the unique primary; the tick must not take any action.
    UnverifiedLeader,
}

impl RoleAssessment {
    pub fn role(&self) -> Role {
        match self {
            Self::Confirmed(role) => *role,
            Self::InferredReplica => Role::Replica,
            Self::UnverifiedLeader => Role::Leader,
        }
    }
}

/// Probe of the local PostgreSQL server, injected into the consensus-store
/// proxy for degraded-mode role inference.
#[async_trait]
pub trait RecoveryProbe: Send + Sync {
    /// Readiness of the local server. Never fails; unreachable means false.
    async fn is_running(&self) -> bool;

    /// `SELECT pg_is_in_recovery()` against the local server.
    async fn is_in_recovery(&self) -> Result<bool, Fault>;
}

/// The daemon's view of the consensus store (through the proxy).
#[async_trait]
pub trait ClusterView: Send + Sync {
    async fn assess_role(&self) -> Result<RoleAssessment, Fault>;

    /// Best-effort self-report of presence and role.
    async fn save_instance_info(&self, role: Role) -> Result<(), Fault>;

    /// Identity and hostname of the current leader.
    async fn leader_info(&self) -> Result<InstanceInfo, Fault>;

    /// Every instance currently registered in the cluster.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, Fault>;
}

/// What a peer probe learned about one cluster member.
///
/// Unreachable is distinct from a failed probe: a dead peer cannot be an
/// orphan leader and must not block failover, while a peer that answered
/// the connection but failed the query proves nothing and fails closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No connection could be established.
    Unreachable,
    /// Connected and `pg_is_in_recovery()` returned true.
    InRecovery,
    /// Connected and writable.
    Writable,
}

/// PostgreSQL shutdown mode, matching `pg_ctl stop -m`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Wait for clients to disconnect.
    Smart,
    /// Disconnect clients, flush, stop.
    Fast,
    /// Abort without a clean shutdown checkpoint.
    Immediate,
}

impl StopMode {
    /// Argument form for `pg_ctl stop -m`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Smart => "smart",
            Self::Fast => "fast",
            Self::Immediate => "immediate",
        }
    }
}

/// Everything the daemon may do to the local PostgreSQL server and its
/// on-disk configuration. Implemented by the postmaster driver; mocked in
/// daemon tests.
#[async_trait]
pub trait PostgresControl: Send + Sync {
    /// Run init-db once against an empty data directory.
    async fn init(&self) -> Result<(), Fault>;

    /// Start the server and wait for readiness. Idempotent when running.
    async fn start(&self) -> Result<(), Fault>;

    async fn stop(&self, mode: StopMode) -> Result<(), Fault>;

    /// Tell the local server to leave recovery.
    async fn promote(&self) -> Result<(), Fault>;

    async fn is_running(&self) -> bool;

    async fn is_in_recovery(&self) -> Result<bool, Fault>;

    async fn is_data_dir_empty(&self) -> Result<bool, Fault>;

    /// Delete every entry in the data directory. Must refuse while the
    /// server runs or the PID file names a live foreign process.
    async fn empty_data_dir(&self) -> Result<(), Fault>;

    /// Stream a base backup from the leader into the (empty) data dir.
    async fn make_base_backup(&self, leader_host: &str) -> Result<(), Fault>;

    /// Poll the leader's readiness until it accepts connections.
    async fn block_and_wait_for_leader(&self, leader_host: &str) -> Result<(), Fault>;

    /// Render and install `postgresql.conf` + `pg_hba.conf` for `role`.
    async fn write_configs(&self, role: Role, leader_host: Option<&str>) -> Result<(), Fault>;

    /// Create the replication user and this instance's physical slot on a
    /// freshly bootstrapped leader.
    async fn setup_replication(&self) -> Result<(), Fault>;

    /// Ensure a physical replication slot exists on `host`.
    async fn create_replication_slot(&self, host: &str, slot_name: &str) -> Result<(), Fault>;

    /// Probe a peer for the orphan check: connect and ask
    /// `pg_is_in_recovery()`. Connection failure is reported as
    /// [`PeerStatus::Unreachable`], not as an error.
    async fn peer_status(&self, host: &str) -> Result<PeerStatus, Fault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assessment_role_mapping() {
        assert_eq!(
            RoleAssessment::Confirmed(Role::Leader).role(),
            Role::Leader
        );
        assert_eq!(RoleAssessment::InferredReplica.role(), Role::Replica);
        assert_eq!(RoleAssessment::UnverifiedLeader.role(), Role::Leader);
    }

    #[test]
    fn test_stop_mode_argument_form() {
        assert_eq!(StopMode::Smart.as_str(), "smart");
        assert_eq!(StopMode::Fast.as_str(), "fast");
        assert_eq!(StopMode::Immediate.as_str(), "immediate");
    }

    #[test]
    fn test_fault_classification() {
        assert!(Fault::fatal("disk gone").is_fatal());
        assert!(!Fault::transient("etcd flap").is_fatal());
        assert!(!Fault::unsafe_refusal("orphan leader").is_fatal());
    }
}
