use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Role;

/// Mode for everything we write next to the data directory; PostgreSQL
/// refuses group/world-accessible config and data files.
const CONFIG_FILE_MODE: u32 = 0o700;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config template {0:?} unreadable: {1}")]
    Template(PathBuf, std::io::Error),

    #[error("config write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Paths and credentials for the local PostgreSQL server, plus the
/// role-aware config renderer.
///
/// The renderer is a pure transformation from the operator-provided template
/// and the current role; rendering the same inputs twice produces identical
/// bytes, which is what makes the reconciliation tick idempotent at the
/// filesystem level.
#[derive(Debug, Clone)]
pub struct PgConfig {
    /// PostgreSQL's own data directory (`$PGDATA`).
    pub data_dir: PathBuf,
    /// Directory for generated config and password files (`$PGEXTRA`).
    pub extra_dir: PathBuf,
    pub admin_username: String,
    pub admin_password: String,
    pub replication_username: String,
    pub replication_password: String,
    /// Externally reachable address of the local server.
    pub hostname: String,
    pub port: u16,
}

impl PgConfig {
    pub fn template_path(&self) -> PathBuf {
        self.extra_dir.join("postgresql.template.conf")
    }

    pub fn postgresql_conf_path(&self) -> PathBuf {
        self.data_dir.join("postgresql.conf")
    }

    pub fn hba_path(&self) -> PathBuf {
        self.extra_dir.join("pg_hba.conf")
    }

    /// Ephemeral admin password file handed to init-db via `--pwfile`.
    pub fn password_file_path(&self) -> PathBuf {
        self.extra_dir.join("password").join("pw")
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.data_dir.join("postmaster.pid")
    }

    /// Render `postgresql.conf` from the template plus role-specific lines.
    ///
    /// Replicas get `primary_conninfo` pointing at the leader and a
    /// physical slot named after this instance; both roles get the slot WAL
    /// retention cap appended.
    pub fn render_postgresql_conf(
        &self,
        template: &str,
        role: Role,
        leader_host: Option<&str>,
        instance_id: &str,
    ) -> String {
        let mut out = String::with_capacity(template.len() + 256);
        out.push_str(template);
        if !out.ends_with('\n') && !out.is_empty() {
            out.push('\n');
        }
        out.push_str("max_slot_wal_keep_size = 40GB\n");

        if role == Role::Replica {
            let leader = leader_host.unwrap_or_default();
            out.push_str(&format!(
                "primary_conninfo = 'user={} password={} host={} port={} sslmode=prefer sslcompression=0'\n",
                self.replication_username, self.replication_password, leader, self.port,
            ));
            out.push_str(&format!("primary_slot_name = '{}'\n", instance_id));
        }

        out
    }

    /// Render `pg_hba.conf`. The replication line is always present so a
    /// promoted replica can serve base backups without a config cycle.
    pub fn render_hba(&self) -> String {
        let mut hba = String::new();
        hba.push_str("local all all trust\n");
        hba.push_str("host all all 0.0.0.0/0 scram-sha-256\n");
        hba.push_str("host all all ::1/128 md5\n");
        hba.push_str(&format!(
            "host replication {} 0.0.0.0/0 md5\n",
            self.replication_username
        ));
        hba
    }

    /// Read the template, render for `role`, and atomically install
    /// `$PGDATA/postgresql.conf`.
    pub fn write_postgresql_conf(
        &self,
        role: Role,
        leader_host: Option<&str>,
        instance_id: &str,
    ) -> Result<(), ConfigError> {
        let template_path = self.template_path();
        let template = fs::read_to_string(&template_path)
            .map_err(|e| ConfigError::Template(template_path, e))?;
        let rendered = self.render_postgresql_conf(&template, role, leader_host, instance_id);
        write_atomic(&self.postgresql_conf_path(), rendered.as_bytes())?;
        Ok(())
    }

    /// Atomically install `$PGEXTRA/pg_hba.conf`.
    pub fn write_hba(&self) -> Result<(), ConfigError> {
        write_atomic(&self.hba_path(), self.render_hba().as_bytes())?;
        Ok(())
    }
}

/// Write-temp-then-rename so a crashed supervisor never leaves a torn
/// config behind for the next start to load.
fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "config".to_string());
    let tmp_path = dir.join(format!(".{}.tmp", file_name));

    let mut file = fs::File::create(&tmp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(CONFIG_FILE_MODE))?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}
