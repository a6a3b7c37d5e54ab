use thiserror::Error;

/// Terminal daemon failures. Everything else is logged and the loop keeps
/// ticking; crashing could leave a running PostgreSQL unsupervised.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("unrecoverable fault: {0}")]
    Fatal(String),
}
