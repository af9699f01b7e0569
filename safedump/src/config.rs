//! Configuration management.
//!
//! Loads configuration from a TOML file, fills gaps from environment
//! variables, and finally applies command-line overrides. Precedence is
//! flag > file > environment: override values are captured as `Option`s
//! before the file is read, so an explicitly set flag can never be
//! clobbered by a config load.

use crate::engine::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Engine kind: postgres, mysql or mariadb
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Host; empty or localhost selects the local socket for PostgreSQL
    #[serde(default)]
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_user")]
    pub user: String,

    /// Never read from the file and never written; env only.
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// gzip level 0-9
    #[serde(default = "default_compression")]
    pub compression: u32,

    /// Parallel databases during cluster operations
    #[serde(default = "default_jobs")]
    pub jobs: usize,

    /// Parallelism passed to the dump tool itself
    #[serde(default = "default_dump_jobs")]
    pub dump_jobs: usize,

    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    #[serde(default = "default_min_backups")]
    pub min_backups: usize,

    /// Per-database operation timeout in minutes
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Reserved: fail runs on Warning-class diagnostics. Off by default.
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloudConfig {
    /// Cloud store URI, e.g. s3://bucket/prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,

    /// Endpoint override for S3-compatible stores (MinIO, B2, blob gateways)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Path to a raw or base64 32-byte key file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    /// Environment variable holding the key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            host: String::new(),
            port: None,
            user: default_user(),
            password: None,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            compression: default_compression(),
            jobs: default_jobs(),
            dump_jobs: default_dump_jobs(),
            retention_days: default_retention_days(),
            min_backups: default_min_backups(),
            timeout_minutes: default_timeout_minutes(),
        }
    }
}

fn default_engine() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/backups/safedump")
}

fn default_compression() -> u32 {
    6
}

fn default_jobs() -> usize {
    4
}

fn default_dump_jobs() -> usize {
    1
}

fn default_retention_days() -> u32 {
    30
}

fn default_min_backups() -> usize {
    3
}

fn default_timeout_minutes() -> u64 {
    240
}

/// Command-line values that were explicitly set. `None` means the flag was
/// absent and the file/environment value applies.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub backup_dir: Option<PathBuf>,
    pub compression: Option<u32>,
    pub jobs: Option<usize>,
    pub dump_jobs: Option<usize>,
    pub cloud_uri: Option<String>,
    pub encrypt: Option<bool>,
    pub key_file: Option<PathBuf>,
    pub key_env: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub engine: Option<String>,
    pub strict: Option<bool>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        warn_unknown_keys(&content, path);
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Resolve the effective configuration: file (if given) over built-in
    /// defaults, environment variables filling unset connection values, and
    /// explicit command-line flags winning over everything.
    pub fn resolve(file: Option<&Path>, overrides: &Overrides) -> anyhow::Result<Self> {
        let mut config = match file {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.fill_from_env();
        config.apply_overrides(overrides);
        Ok(config)
    }

    /// Environment fallbacks for values the file left unset.
    fn fill_from_env(&mut self) {
        let engine: Engine = self.database.engine.parse().unwrap_or(Engine::Postgres);
        let (host_var, port_var, user_var, pass_var) = match engine {
            Engine::Postgres => ("PGHOST", "PGPORT", "PGUSER", "PGPASSWORD"),
            Engine::Mysql | Engine::Mariadb => {
                ("MYSQL_HOST", "MYSQL_PORT", "MYSQL_USER", "MYSQL_PWD")
            }
        };

        if self.database.host.is_empty() {
            if let Ok(host) = std::env::var(host_var) {
                self.database.host = host;
            }
        }
        if self.database.port.is_none() {
            if let Ok(port) = std::env::var(port_var) {
                self.database.port = port.parse().ok();
            }
        }
        if let Ok(user) = std::env::var(user_var) {
            if self.database.user == default_user() {
                self.database.user = user;
            }
        }
        if self.database.password.is_none() {
            self.database.password = std::env::var(pass_var).ok();
        }

        if let Ok(dir) = std::env::var("BACKUP_DIR") {
            if self.backup.backup_dir == default_backup_dir() {
                self.backup.backup_dir = PathBuf::from(dir);
            }
        }
        if let Ok(level) = std::env::var("COMPRESS_LEVEL") {
            if let Ok(level) = level.parse() {
                if self.backup.compression == default_compression() {
                    self.backup.compression = level;
                }
            }
        }
    }

    /// Explicit flags always win. Only `Some` values are applied.
    fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(dir) = &o.backup_dir {
            self.backup.backup_dir = dir.clone();
        }
        if let Some(level) = o.compression {
            self.backup.compression = level;
        }
        if let Some(jobs) = o.jobs {
            self.backup.jobs = jobs;
        }
        if let Some(jobs) = o.dump_jobs {
            self.backup.dump_jobs = jobs;
        }
        if let Some(uri) = &o.cloud_uri {
            self.cloud.uri = Some(uri.clone());
        }
        if let Some(encrypt) = o.encrypt {
            self.encryption.enabled = encrypt;
        }
        if let Some(file) = &o.key_file {
            self.encryption.key_file = Some(file.clone());
        }
        if let Some(var) = &o.key_env {
            self.encryption.key_env = Some(var.clone());
        }
        if let Some(host) = &o.host {
            self.database.host = host.clone();
        }
        if let Some(port) = o.port {
            self.database.port = Some(port);
        }
        if let Some(user) = &o.user {
            self.database.user = user.clone();
        }
        if let Some(engine) = &o.engine {
            self.database.engine = engine.clone();
        }
        if let Some(strict) = o.strict {
            self.security.strict = strict;
        }
    }
}

/// Warn about sections or keys the current version does not recognize.
/// Unknown keys never fail the load.
fn warn_unknown_keys(content: &str, path: &Path) {
    let known_sections: HashSet<&str> =
        ["database", "backup", "security", "cloud", "encryption"].into();
    let known_keys: HashSet<(&str, &str)> = [
        ("database", "engine"),
        ("database", "host"),
        ("database", "port"),
        ("database", "user"),
        ("backup", "backup_dir"),
        ("backup", "compression"),
        ("backup", "jobs"),
        ("backup", "dump_jobs"),
        ("backup", "retention_days"),
        ("backup", "min_backups"),
        ("backup", "timeout_minutes"),
        ("security", "strict"),
        ("cloud", "uri"),
        ("cloud", "endpoint"),
        ("cloud", "region"),
        ("encryption", "enabled"),
        ("encryption", "key_file"),
        ("encryption", "key_env"),
    ]
    .into();

    let Ok(value) = content.parse::<toml::Value>() else {
        return; // the typed parse will surface the error
    };
    let Some(table) = value.as_table() else {
        return;
    };

    for (section, body) in table {
        if !known_sections.contains(section.as_str()) {
            warn!("{}: unknown config section [{}]", path.display(), section);
            continue;
        }
        if section == "database" {
            if let Some(t) = body.as_table() {
                if t.contains_key("password") {
                    warn!(
                        "{}: passwords are not read from config files; use the engine's environment variable",
                        path.display()
                    );
                }
            }
        }
        if let Some(t) = body.as_table() {
            for key in t.keys() {
                if key == "password" {
                    continue;
                }
                if !known_keys.contains(&(section.as_str(), key.as_str())) {
                    warn!(
                        "{}: unknown config key {}.{}",
                        path.display(),
                        section,
                        key
                    );
                }
            }
        }
    }
}
