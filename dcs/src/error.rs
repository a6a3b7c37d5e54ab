use thiserror::Error;

/// Errors surfaced by the consensus-store client.
#[derive(Debug, Error)]
pub enum DcsError {
    /// The election exists but no entry has won yet (or the store briefly
    /// has no leader record). Retryable.
    #[error("no leader elected")]
    NoLeader,

    /// This instance holds no election entry, so it cannot proclaim or
    /// hand off leadership.
    #[error("this instance does not hold the election entry")]
    NotLeader,

    /// Network failure, deadline exceeded, store unavailable. Retryable;
    /// repeated occurrences trip the circuit breaker.
    #[error("consensus store unavailable: {0}")]
    Transient(String),

    /// Structurally malformed keys under our prefix. Not recoverable; the
    /// supervisor aborts rather than act on a keyspace it cannot read.
    #[error("corrupt consensus-store key: {0}")]
    Corrupt(String),
}

impl DcsError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Classify an etcd client error. The etcd election API reports the
    /// absence of a leader as a gRPC status rather than a typed variant.
    pub fn from_etcd(err: etcd_client::Error) -> Self {
        let text = err.to_string();
        if text.contains("no leader") {
            Self::NoLeader
        } else {
            Self::Transient(text)
        }
    }

    /// True for errors that prove the store answered us (the breaker should
    /// count these as availability successes).
    pub fn store_answered(&self) -> bool {
        matches!(self, Self::NoLeader | Self::NotLeader | Self::Corrupt(_))
    }
}

pub type DcsResult<T> = Result<T, DcsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_counts_against_availability() {
        assert!(DcsError::NoLeader.store_answered());
        assert!(DcsError::NotLeader.store_answered());
        assert!(DcsError::corrupt("bad key").store_answered());
        assert!(!DcsError::transient("timeout").store_answered());
    }
}
