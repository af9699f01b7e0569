//! MySQL and MariaDB adapter: mysqldump and the mysql client.
//!
//! Dumps are always plain SQL; the pipeline compresses. There is no
//! cluster-globals tool and no archive table of contents, so those
//! capabilities degrade explicitly.

use super::{
    log_version, parse_version, scan_diagnostics, validate_identifier, ConnectionConfig,
    DumpOptions, DumpToc, Engine, EngineAdapter, RestoreOptions, ToolProcess,
};
use crate::classify::DiagnosticTally;
use crate::error::{Result, SafedumpError};
use crate::process::ProcessManager;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{info, warn};

const SYSTEM_DATABASES: &[&str] = &["mysql", "information_schema", "performance_schema", "sys"];

pub struct MysqlAdapter {
    engine: Engine,
    conn: ConnectionConfig,
    manager: Arc<ProcessManager>,
}

impl MysqlAdapter {
    pub fn new(engine: Engine, conn: ConnectionConfig, manager: Arc<ProcessManager>) -> Self {
        Self {
            engine,
            conn,
            manager,
        }
    }

    /// Base invocation for the client tools. Password travels through
    /// MYSQL_PWD, never argv.
    fn tool(&self, name: &str) -> Command {
        let mut cmd = Command::new(name);
        if !self.conn.host.is_empty() {
            cmd.arg("-h").arg(&self.conn.host);
        }
        if let Some(port) = self.conn.port {
            cmd.arg("-P").arg(port.to_string());
        }
        cmd.arg("-u").arg(&self.conn.user);
        if let Some(password) = &self.conn.password {
            cmd.env("MYSQL_PWD", password);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn query(&self, sql: &str) -> Result<String> {
        let output = self
            .tool("mysql")
            .args(["-N", "-B", "-e"])
            .arg(sql)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SafedumpError::Engine(format!("failed to run mysql: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SafedumpError::Engine(format!(
                "mysql query failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl EngineAdapter for MysqlAdapter {
    fn engine(&self) -> Engine {
        self.engine
    }

    fn is_system_database(&self, db: &str) -> bool {
        SYSTEM_DATABASES.contains(&db)
    }

    fn supports_globals(&self) -> bool {
        // Accounts and grants live in the mysql schema and ride along with
        // ordinary database dumps.
        false
    }

    async fn server_version(&self) -> Result<(u32, u32)> {
        let raw = self.query("SELECT VERSION()").await?;
        let version = parse_version(&raw)?;
        log_version(self.engine, version);
        Ok(version)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let out = self.query("SHOW DATABASES").await?;
        Ok(out
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && !SYSTEM_DATABASES.contains(&l.as_str()))
            .collect())
    }

    async fn list_tables(&self, db: &str) -> Result<Vec<String>> {
        validate_identifier(db)?;
        let out = self
            .query(&format!(
                "SELECT table_name FROM information_schema.tables \
                 WHERE table_schema = '{}' ORDER BY table_name",
                db
            ))
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn database_size(&self, db: &str) -> Result<u64> {
        validate_identifier(db)?;
        let out = self
            .query(&format!(
                "SELECT COALESCE(SUM(data_length + index_length), 0) \
                 FROM information_schema.tables WHERE table_schema = '{}'",
                db
            ))
            .await?;
        out.parse()
            .map_err(|_| SafedumpError::Engine(format!("unparseable database size '{}'", out)))
    }

    async fn is_superuser(&self) -> Result<bool> {
        let grants = self.query("SHOW GRANTS FOR CURRENT_USER()").await?;
        Ok(grants.contains("ALL PRIVILEGES ON *.*") || grants.contains("SUPER"))
    }

    fn start_dump(&self, db: &str, opts: &DumpOptions) -> Result<ToolProcess> {
        let mut cmd = self.tool("mysqldump");
        cmd.args(["--routines", "--triggers", "--events"]);
        if opts.single_transaction {
            cmd.arg("--single-transaction");
        }
        // mysqldump has no per-table data exclusion; excluded tables are
        // dropped wholesale.
        for table in &opts.exclude_data {
            cmd.arg(format!("--ignore-table={}.{}", db, table));
        }
        cmd.arg(db)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        ToolProcess::spawn(&mut cmd, &format!("mysqldump {}", db), self.manager.clone())
    }

    fn start_globals_dump(&self) -> Result<ToolProcess> {
        Err(SafedumpError::Engine(
            "mysql-family engines have no cluster-globals dump".to_string(),
        ))
    }

    /// The dump is plain SQL; the client consumes it directly on stdin
    /// from the (already decrypted and decompressed) file.
    fn start_restore(
        &self,
        db: &str,
        dump_path: &Path,
        opts: &RestoreOptions,
    ) -> Result<ToolProcess> {
        if opts.jobs > 1 {
            warn!("mysql restore is single-threaded; ignoring jobs={}", opts.jobs);
        }
        let input = std::fs::File::open(dump_path)?;
        let mut cmd = self.tool("mysql");
        cmd.arg(db)
            .stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        ToolProcess::spawn(&mut cmd, &format!("mysql {}", db), self.manager.clone())
    }

    async fn run_sql_script(&self, db: &str, script: &Path) -> Result<DiagnosticTally> {
        let input = std::fs::File::open(script)?;
        let mut cmd = self.tool("mysql");
        cmd.arg(db)
            .stdin(Stdio::from(input))
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut proc =
            ToolProcess::spawn(&mut cmd, &format!("mysql {}", db), self.manager.clone())?;
        let stderr = proc.take_stderr()?;

        let (tally, status) = tokio::join!(scan_diagnostics(stderr, db), proc.wait());
        let tally = tally?;
        let status = status?;
        if !status.success() {
            warn!("mysql {} exited with {} (tally: {:?})", db, status, tally);
        }
        Ok(tally)
    }

    async fn terminate_other_connections(&self, db: &str) -> Result<()> {
        validate_identifier(db)?;
        let out = self
            .query(&format!(
                "SELECT id FROM information_schema.processlist \
                 WHERE db = '{}' AND id <> CONNECTION_ID()",
                db
            ))
            .await?;
        let mut terminated = 0usize;
        for id in out.lines().filter(|l| !l.trim().is_empty()) {
            // A session may vanish between the listing and the KILL.
            match self.query(&format!("KILL {}", id.trim())).await {
                Ok(_) => terminated += 1,
                Err(e) => warn!("KILL {} failed: {}", id.trim(), e),
            }
        }
        if terminated > 0 {
            info!("terminated {} connection(s) to {}", terminated, db);
        }
        Ok(())
    }

    async fn drop_database(&self, db: &str) -> Result<()> {
        if self.is_system_database(db) {
            info!("{} is a system database; not dropping", db);
            return Ok(());
        }
        validate_identifier(db)?;
        self.query(&format!("DROP DATABASE IF EXISTS `{}`", db)).await?;
        Ok(())
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        if self.is_system_database(db) {
            info!("{} is a system database; skipping creation", db);
            return Ok(());
        }
        validate_identifier(db)?;
        self.query(&format!("CREATE DATABASE IF NOT EXISTS `{}`", db))
            .await?;
        Ok(())
    }

    async fn inspect_dump_toc(&self, _dump_path: &Path) -> Result<DumpToc> {
        // Plain SQL has no table of contents; large-object pressure is a
        // PostgreSQL concern.
        Ok(DumpToc::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> MysqlAdapter {
        MysqlAdapter::new(
            Engine::Mariadb,
            ConnectionConfig {
                host: "db.internal".to_string(),
                port: Some(3306),
                user: "root".to_string(),
                password: None,
            },
            Arc::new(ProcessManager::new()),
        )
    }

    #[test]
    fn test_system_databases() {
        let a = adapter();
        assert!(a.is_system_database("mysql"));
        assert!(a.is_system_database("performance_schema"));
        assert!(!a.is_system_database("shop"));
    }

    #[test]
    fn test_no_globals_support() {
        let a = adapter();
        assert!(!a.supports_globals());
        assert!(a.start_globals_dump().is_err());
    }
}
