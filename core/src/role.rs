use std::fmt;

/// Cluster-logical role of one PostgreSQL instance.
///
/// The consensus store is the source of truth; a supervisor never stores its
/// role authoritatively, it recomputes it every reconciliation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The unique writable primary.
    Leader,
    /// Read-only, streaming from the leader, in recovery.
    Replica,
}

impl Role {
    /// Raw-string wire form stored in the consensus store (not JSON).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::Replica => "replica",
        }
    }

    /// Parse the wire form back; `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "leader" => Some(Self::Leader),
            "replica" => Some(Self::Replica),
            _ => None,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_form_round_trips() {
        assert_eq!(Role::parse(Role::Leader.as_str()), Some(Role::Leader));
        assert_eq!(Role::parse(Role::Replica.as_str()), Some(Role::Replica));
    }

    #[test]
    fn test_role_rejects_unknown_strings() {
        assert_eq!(Role::parse("master"), None);
        assert_eq!(Role::parse(""), None);
        assert_eq!(Role::parse("Leader"), None);
    }

    #[test]
    fn test_role_display() {
        assert_eq!(Role::Leader.to_string(), "leader");
        assert_eq!(Role::Replica.to_string(), "replica");
    }
}
