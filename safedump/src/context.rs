//! Shared state for one command invocation.

use crate::config::Config;
use crate::engine::EngineAdapter;
use crate::error::{Result, SafedumpError};
use crate::metrics::SessionMetrics;
use crate::process::ProcessManager;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an orchestrator needs: resolved configuration, the engine
/// adapter, the process registry, session metrics and the root
/// cancellation token. Cheap to clone into spawned workers.
#[derive(Clone)]
pub struct OpContext {
    pub config: Arc<Config>,
    pub adapter: Arc<dyn EngineAdapter>,
    pub manager: Arc<ProcessManager>,
    pub metrics: Arc<SessionMetrics>,
    pub cancel: CancellationToken,
    /// Raw key material when encryption is in play; resolved once from the
    /// configured key source.
    pub key_material: Option<Arc<Vec<u8>>>,
}

impl OpContext {
    /// Key material, required. Errors when encryption was requested but no
    /// key source produced material.
    pub fn require_key(&self) -> Result<&[u8]> {
        self.key_material
            .as_deref()
            .map(|v| v.as_slice())
            .ok_or_else(|| {
                SafedumpError::Config(
                    "encryption requested but no key configured; \
                     use --encryption-key-file, --encryption-key-env or a passphrase"
                        .to_string(),
                )
            })
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.backup.timeout_minutes * 60)
    }
}
