//! Point-in-time recovery for PostgreSQL.
//!
//! The controller configures WAL archiving, reports on the archive, trims
//! it, and writes the recovery configuration for a chosen target. Physical
//! replay stays with the server; safedump only prepares the configuration
//! and the archive.

use crate::context::OpContext;
use crate::engine::Engine;
use crate::error::{Result, SafedumpError};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Exactly one recovery target per invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryTarget {
    Time(String),
    Xid(String),
    Lsn(String),
    Name(String),
    Immediate,
}

impl RecoveryTarget {
    /// Build from the command-line flags, rejecting zero or multiple
    /// targets before any side effect.
    pub fn from_flags(
        time: Option<String>,
        xid: Option<String>,
        lsn: Option<String>,
        name: Option<String>,
        immediate: bool,
    ) -> Result<Self> {
        let mut targets: Vec<RecoveryTarget> = Vec::new();
        if let Some(t) = time {
            targets.push(RecoveryTarget::Time(t));
        }
        if let Some(x) = xid {
            targets.push(RecoveryTarget::Xid(x));
        }
        if let Some(l) = lsn {
            targets.push(RecoveryTarget::Lsn(l));
        }
        if let Some(n) = name {
            targets.push(RecoveryTarget::Name(n));
        }
        if immediate {
            targets.push(RecoveryTarget::Immediate);
        }
        match targets.len() {
            1 => Ok(targets.remove(0)),
            0 => Err(SafedumpError::RecoveryTarget(
                "no recovery target given; pass exactly one of \
                 --target-time, --target-xid, --target-lsn, --target-name, --target-immediate"
                    .to_string(),
            )),
            _ => Err(SafedumpError::RecoveryTarget(
                "multiple recovery targets given; pass exactly one".to_string(),
            )),
        }
    }

    fn setting(&self) -> (String, String) {
        match self {
            RecoveryTarget::Time(t) => ("recovery_target_time".to_string(), t.clone()),
            RecoveryTarget::Xid(x) => ("recovery_target_xid".to_string(), x.clone()),
            RecoveryTarget::Lsn(l) => ("recovery_target_lsn".to_string(), l.clone()),
            RecoveryTarget::Name(n) => ("recovery_target_name".to_string(), n.clone()),
            RecoveryTarget::Immediate => {
                ("recovery_target".to_string(), "immediate".to_string())
            }
        }
    }
}

/// Archive summary reported by `pitr status`.
#[derive(Debug, Default)]
pub struct ArchiveStatus {
    pub segments: usize,
    pub total_bytes: u64,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

/// Configure the server to ship WAL segments into `archive_dir`. The
/// settings need a server restart to take effect.
pub async fn enable(ctx: &OpContext, archive_dir: &Path) -> Result<()> {
    if ctx.adapter.engine() != Engine::Postgres {
        return Err(SafedumpError::Engine(
            "point-in-time recovery is PostgreSQL-only".to_string(),
        ));
    }
    tokio::fs::create_dir_all(archive_dir).await?;

    let script = tempfile::NamedTempFile::new()?;
    let mut script_file = script.as_file();
    writeln!(
        script_file,
        "ALTER SYSTEM SET wal_level = 'replica';\n\
         ALTER SYSTEM SET archive_mode = 'on';\n\
         ALTER SYSTEM SET archive_command = 'test ! -f {dir}/%f && cp %p {dir}/%f';\n\
         SELECT pg_reload_conf();",
        dir = archive_dir.display()
    )?;
    script.as_file().sync_all()?;

    let tally = ctx.adapter.run_sql_script("postgres", script.path()).await?;
    if !tally.is_success() {
        return Err(SafedumpError::Engine(
            "could not apply archiving settings".to_string(),
        ));
    }
    info!(
        "WAL archiving configured into {}; archive_mode requires a server restart",
        archive_dir.display()
    );
    Ok(())
}

/// Summarize the archived segments.
pub async fn status(archive_dir: &Path) -> Result<ArchiveStatus> {
    let mut segments = list_segments(archive_dir).await?;
    segments.sort_by(|a, b| a.0.cmp(&b.0));

    Ok(ArchiveStatus {
        segments: segments.len(),
        total_bytes: segments.iter().map(|(_, size)| size).sum(),
        oldest: segments.first().map(|(name, _)| name.clone()),
        newest: segments.last().map(|(name, _)| name.clone()),
    })
}

/// Trim the archive to the newest `keep_segments` segments. WAL file names
/// are monotonic, so lexicographic order is replay order.
pub async fn cleanup(archive_dir: &Path, keep_segments: usize, dry_run: bool) -> Result<usize> {
    let mut segments = list_segments(archive_dir).await?;
    segments.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (name, _) in segments.into_iter().skip(keep_segments) {
        let path = archive_dir.join(&name);
        if dry_run {
            info!("would remove archived segment {}", name);
            removed += 1;
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("removed archived segment {}", name);
                removed += 1;
            }
            Err(e) => warn!("could not remove {}: {}", name, e),
        }
    }
    Ok(removed)
}

/// Write the recovery configuration for `target`. The operator restores
/// the base backup into the data directory, appends this file to
/// postgresql.auto.conf (or includes it), touches recovery.signal and
/// starts the server.
pub async fn recover(
    ctx: &OpContext,
    archive_dir: &Path,
    target: &RecoveryTarget,
    output: &Path,
) -> Result<PathBuf> {
    if ctx.adapter.engine() != Engine::Postgres {
        return Err(SafedumpError::Engine(
            "point-in-time recovery is PostgreSQL-only".to_string(),
        ));
    }
    let config = render_recovery_config(archive_dir, target);
    tokio::fs::write(output, config.as_bytes()).await?;
    info!(
        "recovery configuration written to {}; copy it into the data directory's \
         postgresql.auto.conf and create recovery.signal before starting the server",
        output.display()
    );
    Ok(output.to_path_buf())
}

/// Render the recovery settings. Pure so target handling is testable.
pub fn render_recovery_config(archive_dir: &Path, target: &RecoveryTarget) -> String {
    let (key, value) = target.setting();
    format!(
        "restore_command = 'cp {dir}/%f %p'\n\
         {key} = '{value}'\n\
         recovery_target_action = 'promote'\n",
        dir = archive_dir.display(),
        key = key,
        value = value
    )
}

/// WAL segment names are 24 hex characters; history and partial files are
/// counted too since replay may need them.
async fn list_segments(archive_dir: &Path) -> Result<Vec<(String, u64)>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(archive_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !is_wal_name(&name) {
            continue;
        }
        let size = entry.metadata().await?.len();
        out.push((name, size));
    }
    Ok(out)
}

fn is_wal_name(name: &str) -> bool {
    let base = name
        .trim_end_matches(".partial")
        .trim_end_matches(".history");
    base.len() >= 8 && base.chars().all(|c| c.is_ascii_hexdigit())
}
