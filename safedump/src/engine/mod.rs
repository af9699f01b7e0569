//! Database engine adapters.
//!
//! One adapter per engine family hides the vendor tooling behind a uniform
//! capability set: list databases, query sizes and privileges, spawn dump
//! and restore subprocesses with the right flags, and run administrative
//! SQL. Everything above this module is engine-agnostic.

mod mysql;
mod postgres;

pub use mysql::MysqlAdapter;
pub use postgres::PostgresAdapter;

use crate::classify::{classify, DiagnosticTally, ErrorClass};
use crate::config::DatabaseConfig;
use crate::error::{Result, SafedumpError};
use crate::process::ProcessManager;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::ExitStatus;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, info, warn};

/// Databases above this size are dumped in the streaming-friendly plain
/// format; smaller ones use the engine's custom format.
pub const CUSTOM_FORMAT_MAX_BYTES: u64 = 5 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
    Mariadb,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
            Engine::Mariadb => "mariadb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Engine {
    type Err = SafedumpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(Engine::Postgres),
            "mysql" => Ok(Engine::Mysql),
            "mariadb" => Ok(Engine::Mariadb),
            other => Err(SafedumpError::Config(format!(
                "unknown engine '{}': expected postgres, mysql or mariadb",
                other
            ))),
        }
    }
}

/// Connection parameters shared by every tool invocation.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
}

impl ConnectionConfig {
    pub fn from_database(db: &DatabaseConfig) -> Self {
        Self {
            host: db.host.clone(),
            port: db.port,
            user: db.user.clone(),
            password: db.password.clone(),
        }
    }

    /// PostgreSQL peer authentication only works over the local socket, so
    /// for local hosts the TCP host flag is omitted entirely.
    pub fn uses_local_socket(&self) -> bool {
        self.host.is_empty() || self.host == "localhost" || self.host == "127.0.0.1"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    /// Engine-native archive format (pg_dump -Fc). Seekable, supports
    /// parallel restore and ToC inspection.
    #[default]
    Custom,
    /// Plain SQL text; the pipeline handles compression.
    Plain,
}

/// Options for a dump invocation. Compression is never delegated to the
/// tool; the pipeline owns it.
#[derive(Debug, Clone, Default)]
pub struct DumpOptions {
    pub format: DumpFormat,
    /// Parallelism inside the dump tool itself.
    pub dump_jobs: usize,
    /// Off by default: a single transaction holds every lock for the whole
    /// dump, which does not survive clusters with many large objects.
    pub single_transaction: bool,
    /// Tables whose data (PostgreSQL) or whole definition (MySQL family)
    /// is left out of the dump. Used by sample mode.
    pub exclude_data: Vec<String>,
}

/// Options for a restore invocation. `exit_on_error` and
/// `single_transaction` stay off so each object restores in its own
/// transaction and locks release incrementally; termination decisions
/// belong to the diagnostic classifier.
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub jobs: usize,
    pub no_owner: bool,
    pub no_privileges: bool,
    pub exit_on_error: bool,
    pub single_transaction: bool,
}

/// Summary of an archive's table of contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpToc {
    pub entries: usize,
    pub large_objects: usize,
}

impl DumpToc {
    pub fn has_large_objects(&self) -> bool {
        self.large_objects > 0
    }
}

/// A spawned engine tool, registered with the process manager for
/// cancellation fan-out. `wait` unregisters the child.
pub struct ToolProcess {
    child: Child,
    pid: Option<u32>,
    label: String,
    manager: Arc<ProcessManager>,
}

impl ToolProcess {
    pub fn spawn(
        command: &mut Command,
        label: &str,
        manager: Arc<ProcessManager>,
    ) -> Result<Self> {
        let child = command
            .spawn()
            .map_err(|e| SafedumpError::Engine(format!("failed to spawn {}: {}", label, e)))?;
        let pid = child.id();
        manager.register(&child, label);
        debug!("spawned {} (pid {:?})", label, pid);
        Ok(Self {
            child,
            pid,
            label: label.to_string(),
            manager,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_stdout(&mut self) -> Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| SafedumpError::Engine(format!("{}: stdout not piped", self.label)))
    }

    pub fn take_stdin(&mut self) -> Result<ChildStdin> {
        self.child
            .stdin
            .take()
            .ok_or_else(|| SafedumpError::Engine(format!("{}: stdin not piped", self.label)))
    }

    pub fn take_stderr(&mut self) -> Result<tokio::process::ChildStderr> {
        self.child
            .stderr
            .take()
            .ok_or_else(|| SafedumpError::Engine(format!("{}: stderr not piped", self.label)))
    }

    /// Wait for the tool to exit and drop it from the registry.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self.child.wait().await?;
        if let Some(pid) = self.pid.take() {
            self.manager.unregister(pid);
        }
        Ok(status)
    }

    /// Best-effort kill for cleanup paths. The registry entry is removed
    /// either way.
    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("{}: kill failed: {}", self.label, e);
        }
        if let Some(pid) = self.pid.take() {
            self.manager.unregister(pid);
        }
    }
}

/// Read a tool's stderr line by line, classify each diagnostic, log it at
/// the matching level and tally it. Returns when the stream ends.
pub async fn scan_diagnostics<R>(reader: R, context: &str) -> Result<DiagnosticTally>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut tally = DiagnosticTally::default();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let c = classify(&line);
        tally.record(&c);
        match c.class {
            ErrorClass::Ignorable => debug!("[{}] {} ({})", context, line, c.category),
            ErrorClass::Warning => warn!("[{}] {} ({})", context, line, c.category),
            ErrorClass::Critical => {
                error!("[{}] {} ({}: {})", context, line, c.category, c.remediation)
            }
            ErrorClass::Fatal => {
                error!(
                    "[{}] FATAL {} ({}: {})",
                    context, line, c.category, c.remediation
                );
            }
        }
    }
    Ok(tally)
}

/// Uniform engine capability set consumed by the orchestrators.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine(&self) -> Engine;

    /// System databases are never dropped during restore; creation is
    /// skipped with an informational note.
    fn is_system_database(&self, db: &str) -> bool;

    async fn server_version(&self) -> Result<(u32, u32)>;

    async fn list_databases(&self) -> Result<Vec<String>>;

    async fn list_tables(&self, db: &str) -> Result<Vec<String>>;

    async fn database_size(&self, db: &str) -> Result<u64>;

    async fn is_superuser(&self) -> Result<bool>;

    /// Spawn the dump tool for one database with stdout and stderr piped.
    fn start_dump(&self, db: &str, opts: &DumpOptions) -> Result<ToolProcess>;

    /// Whether the engine has a cluster-wide globals dump (roles,
    /// tablespaces). MySQL-family accounts live inside the system schema
    /// and are covered by ordinary database dumps.
    fn supports_globals(&self) -> bool;

    /// Spawn the cluster-wide globals dump. Only valid when
    /// `supports_globals` is true.
    fn start_globals_dump(&self) -> Result<ToolProcess>;

    /// Spawn the restore tool consuming a seekable dump file.
    fn start_restore(
        &self,
        db: &str,
        dump_path: &Path,
        opts: &RestoreOptions,
    ) -> Result<ToolProcess>;

    /// Run a SQL script file against a database, classifying the tool's
    /// diagnostics. A non-zero exit with a clean tally stays a warning.
    async fn run_sql_script(&self, db: &str, script: &Path) -> Result<DiagnosticTally>;

    async fn terminate_other_connections(&self, db: &str) -> Result<()>;

    async fn drop_database(&self, db: &str) -> Result<()>;

    /// Create a database from an explicitly empty template so local
    /// template additions cannot collide with restored objects.
    async fn create_database(&self, db: &str) -> Result<()>;

    /// Inspect an engine-custom dump's table of contents. Plain-SQL engines
    /// report an empty ToC.
    async fn inspect_dump_toc(&self, dump_path: &Path) -> Result<DumpToc>;
}

/// Build the adapter for the configured engine.
pub fn open_adapter(
    engine: Engine,
    conn: ConnectionConfig,
    manager: Arc<ProcessManager>,
) -> Arc<dyn EngineAdapter> {
    match engine {
        Engine::Postgres => Arc::new(PostgresAdapter::new(conn, manager)),
        Engine::Mysql | Engine::Mariadb => Arc::new(MysqlAdapter::new(engine, conn, manager)),
    }
}

/// Deterministic table selection for sample backups: a table is kept when
/// its FNV-1a hash modulo `ratio` is zero. Ratio 1 keeps everything.
pub fn sample_keeps_table(table: &str, ratio: u32) -> bool {
    if ratio <= 1 {
        return true;
    }
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in table.as_bytes() {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash % u64::from(ratio) == 0
}

/// Validate an identifier before it is interpolated into administrative
/// SQL. Engine tools receive names as argv entries and need no quoting,
/// but DROP/CREATE statements are built as text.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 63 {
        return Err(SafedumpError::Engine(format!(
            "invalid database name: '{}'",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '$')
    {
        return Err(SafedumpError::Engine(format!(
            "database name contains unsupported characters: '{}'",
            name
        )));
    }
    Ok(())
}

pub(crate) fn log_version(engine: Engine, version: (u32, u32)) {
    info!("{} server version {}.{}", engine, version.0, version.1);
}

pub(crate) fn parse_version(raw: &str) -> Result<(u32, u32)> {
    let trimmed = raw.trim();
    let core: String = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = core.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| SafedumpError::Engine(format!("unparseable server version '{}'", raw)))?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Ok((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_from_str() {
        assert_eq!("postgres".parse::<Engine>().unwrap(), Engine::Postgres);
        assert_eq!("PostgreSQL".parse::<Engine>().unwrap(), Engine::Postgres);
        assert_eq!("mariadb".parse::<Engine>().unwrap(), Engine::Mariadb);
        assert!("oracle".parse::<Engine>().is_err());
    }

    #[test]
    fn test_local_socket_detection() {
        let mut conn = ConnectionConfig {
            host: String::new(),
            port: None,
            user: "postgres".to_string(),
            password: None,
        };
        assert!(conn.uses_local_socket());
        conn.host = "localhost".to_string();
        assert!(conn.uses_local_socket());
        conn.host = "127.0.0.1".to_string();
        assert!(conn.uses_local_socket());
        conn.host = "db.internal".to_string();
        assert!(!conn.uses_local_socket());
    }

    #[test]
    fn test_parse_version_variants() {
        assert_eq!(parse_version("16.4").unwrap(), (16, 4));
        assert_eq!(parse_version("16.4 (Debian 16.4-1)").unwrap(), (16, 4));
        assert_eq!(parse_version("8.0.36-0ubuntu0.22.04.1").unwrap(), (8, 0));
        assert_eq!(parse_version("11.4.2-MariaDB").unwrap(), (11, 4));
        assert!(parse_version("devel").is_err());
    }

    #[test]
    fn test_sample_selection_is_deterministic() {
        let tables = ["users", "orders", "events", "audit_log", "sessions"];
        let first: Vec<bool> = tables.iter().map(|t| sample_keeps_table(t, 3)).collect();
        let second: Vec<bool> = tables.iter().map(|t| sample_keeps_table(t, 3)).collect();
        assert_eq!(first, second);
        assert!(tables.iter().all(|t| sample_keeps_table(t, 1)));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("app_db").is_ok());
        assert!(validate_identifier("tenant-7").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("x; DROP DATABASE y").is_err());
        assert!(validate_identifier("name with spaces").is_err());
    }

    #[tokio::test]
    async fn test_scan_diagnostics_tallies_classes() {
        let input = b"ERROR: relation \"users\" already exists\n\
                      ERROR: permission denied for schema public\n\
                      NOTICE: something unusual\n" as &[u8];
        let tally = scan_diagnostics(input, "app").await.unwrap();
        assert_eq!(tally.ignorable, 1);
        assert_eq!(tally.critical, 1);
        assert_eq!(tally.critical_non_duplicate, 1);
        assert_eq!(tally.warning, 1);
        assert!(!tally.is_success());
    }

    proptest::proptest! {
        #[test]
        fn prop_identifier_validation_blocks_metacharacters(
            prefix in "[a-z]{0,8}",
            meta in proptest::sample::select(vec!['\'', '"', '`', ';', ' ', '\\', '.']),
            suffix in "[a-z]{0,8}",
        ) {
            let candidate = format!("{}{}{}", prefix, meta, suffix);
            proptest::prop_assert!(validate_identifier(&candidate).is_err());
        }

        #[test]
        fn prop_sample_ratio_one_keeps_everything(table in "[a-z_]{1,24}") {
            proptest::prop_assert!(sample_keeps_table(&table, 1));
            proptest::prop_assert!(sample_keeps_table(&table, 0));
        }
    }
}
