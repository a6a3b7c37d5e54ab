//! Shared vocabulary for the pgwarden supervisor.
//!
//! This crate holds the types every other crate agrees on:
//! - [`Role`] and the raw-string wire form the consensus store uses
//! - instance identity ([`Identity`], [`InstanceInfo`])
//! - [`PgConfig`] and the role-aware config renderer
//! - [`RetryPolicy`], an explicit retry value threaded through constructors
//! - the capability traits ([`ClusterView`], [`PostgresControl`],
//!   [`RecoveryProbe`]) that decouple the reconciliation daemon from the
//!   concrete etcd and PostgreSQL drivers

mod config;
mod instance;
mod retry;
mod role;
mod traits;

pub use config::{ConfigError, PgConfig};
pub use instance::{Identity, InstanceInfo};
pub use retry::RetryPolicy;
pub use role::Role;
pub use traits::{
    ClusterView, Fault, PeerStatus, PostgresControl, RecoveryProbe, RoleAssessment, StopMode,
};
