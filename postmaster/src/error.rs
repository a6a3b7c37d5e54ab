use thiserror::Error;

/// Errors from the PostgreSQL lifecycle driver.
#[derive(Debug, Error)]
pub enum PostmasterError {
    /// Init-db requested against a non-empty data directory.
    #[error("data directory is not empty, already initialised")]
    AlreadyInitialized,

    /// An external tool exited non-zero or could not be spawned.
    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: &'static str, detail: String },

    #[error("server failed to start: {0}")]
    StartFailed(String),

    #[error("server failed to stop: {0}")]
    StopFailed(String),

    #[error("promotion failed: {0}")]
    PromoteFailed(String),

    /// A destructive operation was refused because its safety precondition
    /// does not hold (server running, PID mismatch).
    #[error("refused unsafe operation: {0}")]
    RefusedUnsafe(String),

    #[error("base backup failed: {0}")]
    BackupFailed(String),

    #[error("leader unreachable: {0}")]
    LeaderUnreachable(String),

    #[error("connection error: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("config error: {0}")]
    Config(#[from] pgwarden_core::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PostmasterError {
    pub fn external(tool: &'static str, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool,
            detail: detail.into(),
        }
    }

    pub fn refused(msg: impl Into<String>) -> Self {
        Self::RefusedUnsafe(msg.into())
    }
}

pub type PostmasterResult<T> = Result<T, PostmasterError>;
