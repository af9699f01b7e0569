//! Shared fixtures for unit tests.

use crate::classify::DiagnosticTally;
use crate::config::Config;
use crate::context::OpContext;
use crate::engine::{
    DumpOptions, DumpToc, Engine, EngineAdapter, RestoreOptions, ToolProcess,
};
use crate::error::{Result, SafedumpError};
use crate::metrics::SessionMetrics;
use crate::process::ProcessManager;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Adapter that answers administrative queries with canned values and
/// refuses to spawn tools. Enough for orchestrator plumbing tests; spawn
/// attempts record their options before failing so callers can assert on
/// the flags the orchestrator chose.
pub struct StubAdapter {
    pub superuser: bool,
    pub restore_options: std::sync::Mutex<Vec<RestoreOptions>>,
}

impl Default for StubAdapter {
    fn default() -> Self {
        Self {
            superuser: true,
            restore_options: std::sync::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EngineAdapter for StubAdapter {
    fn engine(&self) -> Engine {
        Engine::Postgres
    }

    fn is_system_database(&self, db: &str) -> bool {
        matches!(db, "postgres" | "template0" | "template1")
    }

    fn supports_globals(&self) -> bool {
        true
    }

    async fn server_version(&self) -> Result<(u32, u32)> {
        Ok((16, 0))
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(vec!["app".to_string()])
    }

    async fn list_tables(&self, _db: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn database_size(&self, _db: &str) -> Result<u64> {
        Ok(0)
    }

    async fn is_superuser(&self) -> Result<bool> {
        Ok(self.superuser)
    }

    fn start_dump(&self, _db: &str, _opts: &DumpOptions) -> Result<ToolProcess> {
        Err(SafedumpError::Engine("stub adapter spawns nothing".to_string()))
    }

    fn start_globals_dump(&self) -> Result<ToolProcess> {
        Err(SafedumpError::Engine("stub adapter spawns nothing".to_string()))
    }

    fn start_restore(
        &self,
        _db: &str,
        _dump_path: &Path,
        opts: &RestoreOptions,
    ) -> Result<ToolProcess> {
        self.restore_options
            .lock()
            .expect("options mutex poisoned")
            .push(opts.clone());
        Err(SafedumpError::Engine("stub adapter spawns nothing".to_string()))
    }

    async fn run_sql_script(&self, _db: &str, _script: &Path) -> Result<DiagnosticTally> {
        Ok(DiagnosticTally::default())
    }

    async fn terminate_other_connections(&self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn drop_database(&self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn create_database(&self, _db: &str) -> Result<()> {
        Ok(())
    }

    async fn inspect_dump_toc(&self, _dump_path: &Path) -> Result<DumpToc> {
        Ok(DumpToc::default())
    }
}

pub fn test_context() -> OpContext {
    test_context_with(Arc::new(StubAdapter::default()))
}

pub fn test_context_with(adapter: Arc<StubAdapter>) -> OpContext {
    OpContext {
        config: Arc::new(Config::default()),
        adapter,
        manager: Arc::new(ProcessManager::new()),
        metrics: Arc::new(SessionMetrics::new()),
        cancel: CancellationToken::new(),
        key_material: Some(Arc::new(vec![7u8; 32])),
    }
}
