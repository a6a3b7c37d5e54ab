//! Key layout under the cluster prefix.
//!
//! Values are raw strings, never JSON: the hostname key holds the hostname
//! text, the role key holds `"leader"` or `"replica"`, and election entries
//! hold the owner's instance id.

use pgwarden_core::{InstanceInfo, Role};

use crate::{DcsError, DcsResult};

/// Election prefix handed to the etcd election API; entries live under it
/// keyed by lease id.
pub fn election_name(cluster: &str) -> String {
    format!("election/{}", cluster)
}

pub fn info_prefix(cluster: &str) -> String {
    format!("info/{}/", cluster)
}

pub fn hostname_key(cluster: &str, instance_id: &str) -> String {
    format!("info/{}/{}/hostname", cluster, instance_id)
}

pub fn role_key(cluster: &str, instance_id: &str) -> String {
    format!("info/{}/{}/role", cluster, instance_id)
}

/// One field of an instance's info record.
#[derive(Debug, PartialEq, Eq)]
pub enum InfoField {
    Hostname,
    Role,
}

/// Split `info/<cluster>/<instance_id>/<field>` into its parts.
pub fn parse_info_key(cluster: &str, key: &str) -> DcsResult<(String, InfoField)> {
    let prefix = info_prefix(cluster);
    let rest = key
        .strip_prefix(&prefix)
        .ok_or_else(|| DcsError::corrupt(format!("key {} outside prefix {}", key, prefix)))?;

    let mut parts = rest.splitn(2, '/');
    let instance_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DcsError::corrupt(format!("key {} missing instance id", key)))?;
    let field = match parts.next() {
        Some("hostname") => InfoField::Hostname,
        Some("role") => InfoField::Role,
        other => {
            return Err(DcsError::corrupt(format!(
                "key {} has unknown field {:?}",
                key, other
            )))
        }
    };

    Ok((instance_id.to_string(), field))
}

/// Assemble per-instance records from a prefix scan of the info keys.
///
/// Structurally malformed keys are corruption and abort the caller. An
/// instance whose hostname key has not landed yet is skipped: it cannot be
/// connected to, and its registration finishes within one info-key write.
pub fn assemble_instances(cluster: &str, kvs: &[(String, String)]) -> DcsResult<Vec<InstanceInfo>> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Partial {
        hostname: Option<String>,
        role: Option<Role>,
    }

    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();
    for (key, value) in kvs {
        let (instance_id, field) = parse_info_key(cluster, key)?;
        let entry = partials.entry(instance_id).or_default();
        match field {
            InfoField::Hostname => entry.hostname = Some(value.clone()),
            InfoField::Role => entry.role = Role::parse(value),
        }
    }

    let mut instances = Vec::with_capacity(partials.len());
    for (instance_id, partial) in partials {
        match partial.hostname {
            Some(hostname) => instances.push(InstanceInfo {
                instance_id,
                hostname,
                role: partial.role,
            }),
            None => {
                tracing::warn!(%instance_id, "instance has no hostname key yet, skipping");
            }
        }
    }
    Ok(instances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(election_name("main"), "election/main");
        assert_eq!(hostname_key("main", "abc"), "info/main/abc/hostname");
        assert_eq!(role_key("main", "abc"), "info/main/abc/role");
    }

    #[test]
    fn test_parse_info_key_fields() {
        let (id, field) = parse_info_key("main", "info/main/abc/hostname").unwrap();
        assert_eq!(id, "abc");
        assert_eq!(field, InfoField::Hostname);

        let (_, field) = parse_info_key("main", "info/main/abc/role").unwrap();
        assert_eq!(field, InfoField::Role);
    }

    #[test]
    fn test_parse_rejects_malformed_keys() {
        assert!(matches!(
            parse_info_key("main", "info/other/abc/hostname"),
            Err(DcsError::Corrupt(_))
        ));
        assert!(matches!(
            parse_info_key("main", "info/main/abc/color"),
            Err(DcsError::Corrupt(_))
        ));
        assert!(matches!(
            parse_info_key("main", "info/main/abc"),
            Err(DcsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_assemble_groups_fields_per_instance() {
        let kvs = vec![
            ("info/main/a/hostname".to_string(), "host-a".to_string()),
            ("info/main/a/role".to_string(), "leader".to_string()),
            ("info/main/b/hostname".to_string(), "host-b".to_string()),
            ("info/main/b/role".to_string(), "replica".to_string()),
        ];
        let instances = assemble_instances("main", &kvs).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].instance_id, "a");
        assert_eq!(instances[0].hostname, "host-a");
        assert_eq!(instances[0].role, Some(Role::Leader));
        assert_eq!(instances[1].role, Some(Role::Replica));
    }

    #[test]
    fn test_assemble_skips_hostnameless_instance() {
        let kvs = vec![
            ("info/main/a/role".to_string(), "replica".to_string()),
            ("info/main/b/hostname".to_string(), "host-b".to_string()),
        ];
        let instances = assemble_instances("main", &kvs).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].instance_id, "b");
        assert_eq!(instances[0].role, None);
    }

    #[test]
    fn test_assemble_surfaces_corruption() {
        let kvs = vec![("info/main/a/banana".to_string(), "x".to_string())];
        assert!(matches!(
            assemble_instances("main", &kvs),
            Err(DcsError::Corrupt(_))
        ));
    }

    #[test]
    fn test_unparseable_role_value_reads_as_none() {
        let kvs = vec![
            ("info/main/a/hostname".to_string(), "host-a".to_string()),
            ("info/main/a/role".to_string(), "primary".to_string()),
        ];
        let instances = assemble_instances("main", &kvs).unwrap();
        assert_eq!(instances[0].role, None);
    }
}
