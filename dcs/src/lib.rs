//! Consensus-store client and proxy.
//!
//! This crate provides:
//! - [`EtcdDcs`]: the wire-level client over etcd v3: two lease-backed
//!   sessions (election + info), a background campaign, leader observation,
//!   and the per-instance info keys
//! - [`DcsProxy`]: the retry + circuit-breaker wrapper the daemon talks to,
//!   including degraded-mode role inference when the store is unreachable
//!
//! The election session's TTL bounds how long a dead leader can block the
//! cluster; the info session's much longer TTL keeps instance metadata
//! around across short supervisor blips.

mod breaker;
mod error;
mod etcd;
mod keys;
mod proxy;

pub use breaker::{BreakerState, CircuitBreaker};
pub use error::{DcsError, DcsResult};
pub use etcd::{Dcs, DcsConfig, EtcdDcs};
pub use proxy::DcsProxy;
