//! PostgreSQL adapter: pg_dump, pg_dumpall, pg_restore and psql.

use super::{
    log_version, parse_version, scan_diagnostics, validate_identifier, ConnectionConfig,
    DumpFormat, DumpOptions, DumpToc, Engine, EngineAdapter, RestoreOptions, ToolProcess,
};
use crate::classify::DiagnosticTally;
use crate::error::{Result, SafedumpError};
use crate::process::ProcessManager;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Never dropped during restore; creation is skipped.
const SYSTEM_DATABASES: &[&str] = &["postgres", "template0", "template1"];

pub struct PostgresAdapter {
    conn: ConnectionConfig,
    manager: Arc<ProcessManager>,
}

impl PostgresAdapter {
    pub fn new(conn: ConnectionConfig, manager: Arc<ProcessManager>) -> Self {
        Self { conn, manager }
    }

    /// Base invocation for any libpq tool: connection flags plus password
    /// via the environment, never argv. The host flag is omitted for local
    /// sockets so peer authentication works.
    fn tool(&self, name: &str) -> Command {
        let mut cmd = Command::new(name);
        if !self.conn.uses_local_socket() {
            cmd.arg("-h").arg(&self.conn.host);
        }
        if let Some(port) = self.conn.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg("-U").arg(&self.conn.user);
        if let Some(password) = &self.conn.password {
            cmd.env("PGPASSWORD", password);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a short administrative query through psql, returning its
    /// unaligned tuple output.
    async fn query(&self, db: &str, sql: &str) -> Result<String> {
        let output = self
            .tool("psql")
            .args(["-X", "-q", "-t", "-A"])
            .arg("-d")
            .arg(db)
            .arg("-c")
            .arg(sql)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SafedumpError::Engine(format!("failed to run psql: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SafedumpError::Engine(format!(
                "psql query failed: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl EngineAdapter for PostgresAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn is_system_database(&self, db: &str) -> bool {
        SYSTEM_DATABASES.contains(&db)
    }

    fn supports_globals(&self) -> bool {
        true
    }

    async fn server_version(&self) -> Result<(u32, u32)> {
        let raw = self.query("postgres", "SHOW server_version").await?;
        let version = parse_version(&raw)?;
        log_version(Engine::Postgres, version);
        Ok(version)
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let out = self
            .query(
                "postgres",
                "SELECT datname FROM pg_database WHERE datistemplate = false ORDER BY datname",
            )
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn list_tables(&self, db: &str) -> Result<Vec<String>> {
        let out = self
            .query(
                db,
                "SELECT schemaname || '.' || tablename FROM pg_tables \
                 WHERE schemaname NOT IN ('pg_catalog', 'information_schema') \
                 ORDER BY 1",
            )
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn database_size(&self, db: &str) -> Result<u64> {
        validate_identifier(db)?;
        let out = self
            .query(
                "postgres",
                &format!("SELECT pg_database_size('{}')", db),
            )
            .await?;
        out.parse()
            .map_err(|_| SafedumpError::Engine(format!("unparseable database size '{}'", out)))
    }

    async fn is_superuser(&self) -> Result<bool> {
        let out = self
            .query(
                "postgres",
                "SELECT rolsuper FROM pg_roles WHERE rolname = current_user",
            )
            .await?;
        Ok(out == "t")
    }

    fn start_dump(&self, db: &str, opts: &DumpOptions) -> Result<ToolProcess> {
        let mut cmd = self.tool("pg_dump");
        match opts.format {
            DumpFormat::Custom => {
                // Tool-level compression off; the pipeline owns it.
                cmd.args(["--format=custom", "--compress=0"]);
            }
            DumpFormat::Plain => {
                cmd.arg("--format=plain");
            }
        }
        if opts.dump_jobs > 1 {
            // Parallel pg_dump needs the directory format, which cannot
            // stream. Streaming wins.
            debug!("pg_dump to stdout is single-threaded; ignoring dump_jobs={}", opts.dump_jobs);
        }
        for table in &opts.exclude_data {
            cmd.arg(format!("--exclude-table-data={}", table));
        }
        cmd.arg(db)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        ToolProcess::spawn(&mut cmd, &format!("pg_dump {}", db), self.manager.clone())
    }

    fn start_globals_dump(&self) -> Result<ToolProcess> {
        let mut cmd = self.tool("pg_dumpall");
        cmd.arg("--globals-only")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        ToolProcess::spawn(&mut cmd, "pg_dumpall --globals-only", self.manager.clone())
    }

    fn start_restore(
        &self,
        db: &str,
        dump_path: &Path,
        opts: &RestoreOptions,
    ) -> Result<ToolProcess> {
        let mut cmd = self.tool("pg_restore");
        cmd.arg("--dbname").arg(db);
        if opts.jobs > 1 {
            cmd.arg("--jobs").arg(opts.jobs.to_string());
        }
        if opts.no_owner {
            cmd.arg("--no-owner");
        }
        if opts.no_privileges {
            cmd.arg("--no-privileges");
        }
        if opts.exit_on_error {
            cmd.arg("--exit-on-error");
        }
        if opts.single_transaction {
            cmd.arg("--single-transaction");
        }
        cmd.arg(dump_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        ToolProcess::spawn(&mut cmd, &format!("pg_restore {}", db), self.manager.clone())
    }

    async fn run_sql_script(&self, db: &str, script: &Path) -> Result<DiagnosticTally> {
        let mut cmd = self.tool("psql");
        cmd.args(["-X", "-q"])
            .arg("-d")
            .arg(db)
            .arg("-f")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let mut proc = ToolProcess::spawn(&mut cmd, &format!("psql {}", db), self.manager.clone())?;
        let stderr = proc.take_stderr()?;

        let (tally, status) = tokio::join!(scan_diagnostics(stderr, db), proc.wait());
        let tally = tally?;
        let status = status?;
        if !status.success() {
            warn!("psql {} exited with {} (tally: {:?})", db, status, tally);
        }
        Ok(tally)
    }

    async fn terminate_other_connections(&self, db: &str) -> Result<()> {
        validate_identifier(db)?;
        let sql = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid()",
            db
        );
        let out = self.query("postgres", &sql).await?;
        let terminated = out.lines().filter(|l| !l.trim().is_empty()).count();
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
        self.query("postgres", &format!("DROP DATABASE IF EXISTS \"{}\"", db))
            .await?;
        Ok(())
    }

    async fn create_database(&self, db: &str) -> Result<()> {
        if self.is_system_database(db) {
            info!("{} is a system database; skipping creation", db);
            return Ok(());
        }
        validate_identifier(db)?;
        // template0 keeps local template additions out of the restore path.
        self.query(
            "postgres",
            &format!("CREATE DATABASE \"{}\" TEMPLATE template0", db),
        )
        .await?;
        Ok(())
    }

    async fn inspect_dump_toc(&self, dump_path: &Path) -> Result<DumpToc> {
        let output = self
            .tool("pg_restore")
            .arg("-l")
            .arg(dump_path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| SafedumpError::Engine(format!("failed to run pg_restore -l: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SafedumpError::Engine(format!(
                "pg_restore -l {} failed: {}",
                dump_path.display(),
                stderr.trim()
            )));
        }
        Ok(parse_toc(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `pg_restore -l` output. Comment lines start with a semicolon;
/// every other line is one archive entry. Large-object entries carry a
/// BLOB (or, on newer servers, LARGE OBJECT) tag.
fn parse_toc(listing: &str) -> DumpToc {
    let mut toc = DumpToc::default();
    for line in listing.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        toc.entries += 1;
        if line.contains(" BLOB") || line.contains("LARGE OBJECT") {
            toc.large_objects += 1;
        }
    }
    toc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_toc_counts_large_objects() {
        let listing = "\
;
; Archive created at 2026-08-12 03:00:01 UTC
;     dbname: app
;
2; 3079 16384 EXTENSION - plpgsql
215; 1259 16402 TABLE public users app
3099; 2613 24376 BLOB - 24376 app
3100; 2613 24377 BLOB - 24377 app
4316; 0 0 BLOBS - BLOBS app
219; 1259 16420 TABLE public orders app
";
        let toc = parse_toc(listing);
        assert_eq!(toc.entries, 6);
        assert_eq!(toc.large_objects, 3);
        assert!(toc.has_large_objects());
    }

    #[test]
    fn test_parse_toc_without_blobs() {
        let listing = "\
; Archive created at 2026-08-12 03:00:01 UTC
215; 1259 16402 TABLE public users app
216; 1259 16410 SEQUENCE public users_id_seq app
";
        let toc = parse_toc(listing);
        assert_eq!(toc.entries, 2);
        assert!(!toc.has_large_objects());
    }

    #[test]
    fn test_system_databases() {
        let adapter = PostgresAdapter::new(
            ConnectionConfig {
                host: String::new(),
                port: None,
                user: "postgres".to_string(),
                password: None,
            },
            Arc::new(ProcessManager::new()),
        );
        assert!(adapter.is_system_database("postgres"));
        assert!(adapter.is_system_database("template0"));
        assert!(adapter.is_system_database("template1"));
        assert!(!adapter.is_system_database("app"));
    }
}
