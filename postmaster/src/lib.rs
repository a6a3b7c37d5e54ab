//! Lifecycle driver for the local PostgreSQL server.
//!
//! Everything that touches the postgres process, its data directory, or a
//! SQL connection goes through [`Postmaster`]: init-db, start/stop/promote,
//! readiness and recovery probes, base backups, and the destructive
//! data-directory wipe with its PID-file safety check. The external tools
//! (`pg_ctl`, `postgres`, `pg_basebackup`, `pg_isready`) are driven as
//! child processes, never reimplemented.

mod driver;
mod error;
mod pool;

pub use driver::Postmaster;
pub use error::{PostmasterError, PostmasterResult};
pub use pool::PgPools;
