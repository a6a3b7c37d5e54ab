use uuid::Uuid;

use crate::Role;

/// Identity of this supervisor process.
///
/// The instance id is a fresh UUID per process start, so a restarted
/// supervisor re-enters the cluster as a new instance and its stale
/// consensus-store keys age out with their lease.
#[derive(Debug, Clone)]
pub struct Identity {
    pub instance_id: String,
    /// Externally reachable address of the PostgreSQL server.
    pub hostname: String,
}

impl Identity {
    pub fn generate(hostname: impl Into<String>) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            hostname: hostname.into(),
        }
    }
}

/// What the consensus store knows about one cluster member.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub hostname: String,
    /// Last self-reported role; `None` until the instance finished its
    /// first converged tick.
    pub role: Option<Role>,
}
