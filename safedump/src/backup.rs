//! Backup orchestration: single, sample and cluster scope.
//!
//! Every dump flows through the streaming pipeline into a scoped temp
//! workspace, is published to the local sink (plus the optional cloud
//! store) as a payload/checksum/metadata triple, and finally triggers a
//! retention sweep. Partial outputs never reach a sink: staging is in the
//! temp workspace, which is unlinked on every exit path.

use crate::artifact::{
    self, publish_triple, ArtifactFormat, BackupArtifact, BackupKind, EncryptionMode, Scope,
};
use crate::context::OpContext;
use crate::crypto::{self, EncryptingReader, Header, KeyMode, NONCE_LEN, SALT_LEN};
use crate::engine::{
    sample_keeps_table, scan_diagnostics, DumpFormat, DumpOptions, ToolProcess,
    CUSTOM_FORMAT_MAX_BYTES,
};
use crate::error::{Result, SafedumpError};
use crate::metrics::OperationOutcome;
use crate::pipeline::{self, ByteStream, HashingReader, ProgressCallback, ProgressReader};
use crate::retention::{self, RetentionPolicy};
use crate::retry::with_retries;
use crate::store::{open_store, LocalStore, ObjectStore};
use chrono::Utc;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Outcome of one backup command, for the final user-facing summary.
#[derive(Debug)]
pub struct BackupOutcome {
    pub payload_name: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub databases: Vec<String>,
}

struct PipelineRun {
    payload_bytes: u64,
    plaintext_bytes: u64,
    sha256: String,
    encrypted: bool,
}

/// Back up one database.
pub async fn backup_single(ctx: &OpContext, db: &str) -> Result<BackupOutcome> {
    backup_one_database(ctx, db, None).await
}

/// Back up a deterministic sample of one database: tables whose name hash
/// falls outside the 1-in-`ratio` selection have their data excluded.
pub async fn backup_sample(ctx: &OpContext, db: &str, ratio: u32) -> Result<BackupOutcome> {
    if ratio < 1 {
        return Err(SafedumpError::Config(
            "sample ratio must be at least 1".to_string(),
        ));
    }
    backup_one_database(ctx, db, Some(ratio)).await
}

async fn backup_one_database(
    ctx: &OpContext,
    db: &str,
    sample_ratio: Option<u32>,
) -> Result<BackupOutcome> {
    let started = std::time::Instant::now();
    ctx.metrics.operation_started();
    let result = backup_one_inner(ctx, db, sample_ratio).await;

    let outcome = match &result {
        Ok(_) => OperationOutcome::Completed,
        Err(SafedumpError::Cancelled) => OperationOutcome::Aborted,
        Err(_) => OperationOutcome::Failed,
    };
    let name = if sample_ratio.is_some() { "backup-sample" } else { "backup-single" };
    ctx.metrics.record_operation(name, Some(db), outcome, started.elapsed());
    result
}

async fn backup_one_inner(
    ctx: &OpContext,
    db: &str,
    sample_ratio: Option<u32>,
) -> Result<BackupOutcome> {
    let size = match ctx.adapter.database_size(db).await {
        Ok(size) => size,
        Err(e) => {
            warn!("cannot determine size of {}: {}; using custom format", db, e);
            0
        }
    };

    // Small databases get the seekable custom archive; large ones stream
    // as plain SQL through gzip. Samples are always plain.
    let format = if sample_ratio.is_some() || size >= CUSTOM_FORMAT_MAX_BYTES {
        DumpFormat::Plain
    } else {
        DumpFormat::Custom
    };

    let mut opts = DumpOptions {
        format,
        dump_jobs: ctx.config.backup.dump_jobs,
        ..Default::default()
    };
    if let Some(ratio) = sample_ratio {
        let tables = ctx.adapter.list_tables(db).await?;
        let excluded: Vec<String> = tables
            .into_iter()
            .filter(|t| !sample_keeps_table(t, ratio))
            .collect();
        info!(
            "sample backup of {}: 1 in {} tables kept, {} excluded",
            db, ratio, excluded.len()
        );
        opts.exclude_data = excluded;
    }

    let artifact_format = match format {
        DumpFormat::Custom => ArtifactFormat::EngineCustom,
        DumpFormat::Plain => ArtifactFormat::PlainSqlGz,
    };
    let payload_name = format!(
        "{}.{}",
        artifact::base_name(db, Utc::now()),
        artifact_format.extension()
    );

    let workspace = tempfile::tempdir()?;
    let payload_path = workspace.path().join(&payload_name);

    let compress = match format {
        DumpFormat::Plain => Some(ctx.config.backup.compression),
        DumpFormat::Custom => None,
    };
    let proc = ctx.adapter.start_dump(db, &opts)?;
    let run = run_dump_pipeline(ctx, proc, db, compress, &payload_path).await?;

    let artifact = BackupArtifact {
        backup_id: uuid::Uuid::new_v4(),
        name: payload_name.clone(),
        engine: ctx.adapter.engine(),
        scope: if sample_ratio.is_some() { Scope::Sample } else { Scope::Single },
        format: artifact_format,
        created_at: Utc::now(),
        size_bytes_ciphertext: run.payload_bytes,
        size_bytes_plaintext_declared: run.plaintext_bytes,
        sha256: run.sha256.clone(),
        compression_algo: if compress.is_some() { "gzip".to_string() } else { "none".to_string() },
        compression_level: compress.unwrap_or(0),
        encryption: if run.encrypted { EncryptionMode::Aes256Gcm } else { EncryptionMode::None },
        encryption_header_offset: if run.encrypted { Some(0) } else { None },
        databases: vec![db.to_string()],
        backup_type: BackupKind::Full,
        parent_ref: None,
        tool_version: BackupArtifact::tool_version(),
        hostname: current_hostname(),
    };

    publish_everywhere(ctx, &payload_name, &payload_path, &artifact).await?;
    sweep_retention(ctx, &format!("db_{}_", db)).await;

    ctx.metrics.add_bytes_in(run.plaintext_bytes);
    ctx.metrics.add_bytes_out(run.payload_bytes);

    Ok(BackupOutcome {
        payload_name,
        sha256: run.sha256,
        size_bytes: run.payload_bytes,
        databases: vec![db.to_string()],
    })
}

/// Back up every database of the instance into one cluster artifact:
/// globals SQL first, then per-database custom dumps fanned out up to
/// `jobs`, assembled into a tar.gz and published as a single payload.
pub async fn backup_cluster(ctx: &OpContext) -> Result<BackupOutcome> {
    let started = std::time::Instant::now();
    ctx.metrics.operation_started();
    let result = backup_cluster_inner(ctx).await;

    let outcome = match &result {
        Ok(_) => OperationOutcome::Completed,
        Err(SafedumpError::Cancelled) => OperationOutcome::Aborted,
        Err(_) => OperationOutcome::Failed,
    };
    ctx.metrics.record_operation("backup-cluster", None, outcome, started.elapsed());
    result
}

async fn backup_cluster_inner(ctx: &OpContext) -> Result<BackupOutcome> {
    let databases = ctx.adapter.list_databases().await?;
    if databases.is_empty() {
        return Err(SafedumpError::Engine("no databases to back up".to_string()));
    }
    info!("cluster backup of {} database(s)", databases.len());

    let workspace = tempfile::tempdir()?;

    // Globals before any database so restore can replay in the same order.
    if ctx.adapter.supports_globals() {
        let proc = ctx.adapter.start_globals_dump()?;
        let globals_path = workspace.path().join("globals.sql");
        stage_dump_to_file(ctx, proc, "globals", &globals_path).await?;
    }

    let semaphore = Arc::new(Semaphore::new(ctx.config.backup.jobs.max(1)));
    let mut tasks: JoinSet<Result<(String, u64)>> = JoinSet::new();
    for db in databases.clone() {
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        let member_path = workspace.path().join(format!("db_{}.dump", db));
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SafedumpError::Cancelled)?;
            if ctx.cancel.is_cancelled() {
                return Err(SafedumpError::Cancelled);
            }
            let opts = DumpOptions {
                format: DumpFormat::Custom,
                dump_jobs: ctx.config.backup.dump_jobs,
                ..Default::default()
            };
            let proc = ctx.adapter.start_dump(&db, &opts)?;
            let bytes = stage_dump_to_file(&ctx, proc, &db, &member_path).await?;
            Ok((db, bytes))
        });
    }

    // Any failed member fails the whole cluster artifact; remaining dumps
    // are cancelled and the workspace disappears with its guard.
    let mut first_error: Option<SafedumpError> = None;
    let mut plaintext_total = 0u64;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok((db, bytes))) => {
                debug!("cluster member {} dumped ({} bytes)", db, bytes);
                plaintext_total += bytes;
            }
            Ok(Err(e)) => {
                warn!("cluster member dump failed: {}", e);
                if first_error.is_none() {
                    first_error = Some(e);
                    ctx.cancel.cancel();
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    first_error = Some(SafedumpError::Pipeline(format!(
                        "dump worker panicked: {}",
                        join_err
                    )));
                    ctx.cancel.cancel();
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let manifest = serde_json::json!({
        "created_at": Utc::now().to_rfc3339(),
        "engine": ctx.adapter.engine().as_str(),
        "databases": databases,
        "tool_version": BackupArtifact::tool_version(),
    });
    tokio::fs::write(
        workspace.path().join("metadata.json"),
        serde_json::to_vec_pretty(&manifest)?,
    )
    .await?;

    let payload_name = format!(
        "{}.{}",
        artifact::cluster_base_name(Utc::now()),
        ArtifactFormat::TarGz.extension()
    );
    let tar_path = workspace.path().join("cluster.tar.gz");
    build_tarball(workspace.path().to_path_buf(), tar_path.clone(), ctx.config.backup.compression)
        .await?;

    // Hash (and optionally encrypt) the assembled tarball into the final
    // staged payload.
    let payload_path = workspace.path().join(&payload_name);
    let tar_bytes = tokio::fs::metadata(&tar_path).await?.len();
    let tar_file = tokio::fs::File::open(&tar_path).await?;
    let mut stream: ByteStream = Box::new(tar_file);
    let encrypted = ctx.config.encryption.enabled;
    if encrypted {
        stream = encrypt_stage(ctx, stream)?;
    }
    let (mut hashed, digest) = HashingReader::new(stream);
    let payload_bytes = pipeline::run_to_file(&mut hashed, &payload_path, &ctx.cancel).await?;

    let artifact = BackupArtifact {
        backup_id: uuid::Uuid::new_v4(),
        name: payload_name.clone(),
        engine: ctx.adapter.engine(),
        scope: Scope::Cluster,
        format: ArtifactFormat::TarGz,
        created_at: Utc::now(),
        size_bytes_ciphertext: payload_bytes,
        size_bytes_plaintext_declared: tar_bytes,
        sha256: digest.hex(),
        compression_algo: "gzip".to_string(),
        compression_level: ctx.config.backup.compression,
        encryption: if encrypted { EncryptionMode::Aes256Gcm } else { EncryptionMode::None },
        encryption_header_offset: if encrypted { Some(0) } else { None },
        databases: databases.clone(),
        backup_type: BackupKind::Full,
        parent_ref: None,
        tool_version: BackupArtifact::tool_version(),
        hostname: current_hostname(),
    };

    publish_everywhere(ctx, &payload_name, &payload_path, &artifact).await?;
    sweep_retention(ctx, "cluster_").await;

    ctx.metrics.add_bytes_in(plaintext_total);
    ctx.metrics.add_bytes_out(payload_bytes);

    Ok(BackupOutcome {
        payload_name,
        sha256: artifact.sha256,
        size_bytes: payload_bytes,
        databases,
    })
}

/// Drive one dump subprocess through the full pipeline (progress, optional
/// gzip, optional encryption, hashing) into `out_path`, scanning stderr
/// diagnostics on the side. Enforces the per-operation timeout.
async fn run_dump_pipeline(
    ctx: &OpContext,
    mut proc: ToolProcess,
    db: &str,
    compress: Option<u32>,
    out_path: &Path,
) -> Result<PipelineRun> {
    let stdout = proc.take_stdout()?;
    let stderr = proc.take_stderr()?;

    let plaintext = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&plaintext);
    let label = db.to_string();
    let callback: ProgressCallback = Arc::new(move |n| {
        counter.store(n, Ordering::Relaxed);
        debug!("{}: {} bytes dumped", label, n);
    });

    let mut stream: ByteStream = Box::new(ProgressReader::new(stdout, callback));
    if let Some(level) = compress {
        stream = pipeline::gzip_encode(stream, level);
    }
    let encrypted = ctx.config.encryption.enabled;
    if encrypted {
        stream = encrypt_stage(ctx, stream)?;
    }
    let (mut hashed, digest) = HashingReader::new(stream);

    let work = async {
        let (copied, tally) = tokio::join!(
            pipeline::run_to_file(&mut hashed, out_path, &ctx.cancel),
            scan_diagnostics(stderr, db),
        );
        let payload_bytes = copied?;
        let tally = tally?;
        if tally.fatal > 0 {
            return Err(SafedumpError::Dump(format!(
                "{}: fatal diagnostics during dump",
                db
            )));
        }
        Ok((payload_bytes, tally))
    };

    let (payload_bytes, _tally) = match tokio::time::timeout(ctx.timeout(), work).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            proc.kill().await;
            return Err(e);
        }
        Err(_) => {
            proc.kill().await;
            return Err(SafedumpError::Timeout(ctx.config.backup.timeout_minutes));
        }
    };

    let status = proc.wait().await?;
    if !status.success() {
        return Err(SafedumpError::Dump(format!(
            "{}: dump tool exited with {}",
            db, status
        )));
    }

    Ok(PipelineRun {
        payload_bytes,
        plaintext_bytes: plaintext.load(Ordering::Relaxed),
        sha256: digest.hex(),
        encrypted,
    })
}

/// Stage a raw (uncompressed, unencrypted) dump into the workspace, used
/// for cluster members and globals that get wrapped later.
async fn stage_dump_to_file(
    ctx: &OpContext,
    mut proc: ToolProcess,
    label: &str,
    out_path: &Path,
) -> Result<u64> {
    let mut stdout = proc.take_stdout()?;
    let stderr = proc.take_stderr()?;

    let work = async {
        let (copied, tally) = tokio::join!(
            pipeline::run_to_file(&mut stdout, out_path, &ctx.cancel),
            scan_diagnostics(stderr, label),
        );
        let bytes = copied?;
        let tally = tally?;
        if tally.fatal > 0 {
            return Err(SafedumpError::Dump(format!(
                "{}: fatal diagnostics during dump",
                label
            )));
        }
        Ok(bytes)
    };

    let bytes = match tokio::time::timeout(ctx.timeout(), work).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            proc.kill().await;
            return Err(e);
        }
        Err(_) => {
            proc.kill().await;
            return Err(SafedumpError::Timeout(ctx.config.backup.timeout_minutes));
        }
    };

    let status = proc.wait().await?;
    if !status.success() {
        return Err(SafedumpError::Dump(format!(
            "{}: dump tool exited with {}",
            label, status
        )));
    }
    Ok(bytes)
}

/// Wrap a stream in the authenticated encryptor with a fresh nonce and,
/// for passphrase keys, a fresh salt.
fn encrypt_stage(ctx: &OpContext, stream: ByteStream) -> Result<ByteStream> {
    let material = ctx.require_key()?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let (key, mode) = crypto::resolve_key(material, &salt);
    let header_salt = match mode {
        KeyMode::Raw => [0u8; SALT_LEN],
        KeyMode::Derived => salt,
    };
    let header = Header::new(nonce, header_salt);
    Ok(Box::new(EncryptingReader::new(stream, &key, header)))
}

/// Publish the triple to the local sink and, when configured, the cloud
/// store. A failed cloud publish removes its partial triple best-effort.
async fn publish_everywhere(
    ctx: &OpContext,
    payload_name: &str,
    payload_path: &Path,
    artifact: &BackupArtifact,
) -> Result<()> {
    let local = LocalStore::new(ctx.config.backup.backup_dir.clone());
    if let Err(e) = publish_triple(&local, payload_name, payload_path, artifact).await {
        // An interrupted triple write must not leave a partial payload or
        // orphan sidecars in the final sink.
        cleanup_partial(&local, payload_name).await;
        return Err(e);
    }

    if let Some(uri) = &ctx.config.cloud.uri {
        let store = open_store(uri, &ctx.config.cloud).await?;
        let uploaded = with_retries("cloud publish", 3, &ctx.cancel, || {
            publish_triple(store.as_ref(), payload_name, payload_path, artifact)
        })
        .await;
        if let Err(e) = uploaded {
            cleanup_partial(store.as_ref(), payload_name).await;
            return Err(e);
        }
    }
    Ok(())
}

async fn cleanup_partial(store: &dyn ObjectStore, payload_name: &str) {
    if let Err(e) = artifact::delete_triple(store, payload_name).await {
        warn!("could not remove partial upload {}: {}", payload_name, e);
    }
}

/// Retention failures never fail the backup that triggered them.
async fn sweep_retention(ctx: &OpContext, prefix: &str) {
    let policy = RetentionPolicy {
        retention_days: ctx.config.backup.retention_days,
        min_backups: ctx.config.backup.min_backups,
    };

    let local = LocalStore::new(ctx.config.backup.backup_dir.clone());
    if let Err(e) = retention::apply(&local, prefix, policy, false).await {
        warn!("local retention sweep failed: {}", e);
    }

    if let Some(uri) = &ctx.config.cloud.uri {
        match open_store(uri, &ctx.config.cloud).await {
            Ok(store) => {
                if let Err(e) = retention::apply(store.as_ref(), prefix, policy, false).await {
                    warn!("cloud retention sweep failed: {}", e);
                }
            }
            Err(e) => warn!("cannot open cloud store for retention: {}", e),
        }
    }
}

/// Assemble the workspace members into `tar_path`, gzip-compressed. The
/// tarball carries globals.sql, db_<name>.dump members and metadata.json.
async fn build_tarball(workspace: PathBuf, tar_path: PathBuf, level: u32) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::create(&tar_path)?;
        let encoder =
            flate2::write::GzEncoder::new(file, flate2::Compression::new(level.min(9)));
        let mut builder = tar::Builder::new(encoder);

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&workspace)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p != &tar_path && p.is_file())
            .collect();
        entries.sort();
        for path in entries {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    SafedumpError::Pipeline(format!("unrepresentable member name: {:?}", path))
                })?
                .to_string();
            builder.append_path_with_name(&path, &name)?;
        }

        let encoder = builder.into_inner().map_err(SafedumpError::Io)?;
        let file = encoder.finish()?;
        file.sync_all()?;
        Ok(())
    })
    .await
    .map_err(|e| SafedumpError::Pipeline(format!("tar assembly task failed: {}", e)))?
}

fn current_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tar::Archive;

    #[tokio::test]
    async fn test_tarball_contains_workspace_members() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("globals.sql"), b"CREATE ROLE app;\n").unwrap();
        std::fs::write(dir.path().join("db_app.dump"), b"PGDMP-bytes").unwrap();
        std::fs::write(dir.path().join("metadata.json"), b"{}").unwrap();

        let tar_path = dir.path().join("cluster.tar.gz");
        build_tarball(dir.path().to_path_buf(), tar_path.clone(), 6)
            .await
            .unwrap();

        let file = std::fs::File::open(&tar_path).unwrap();
        let mut archive = Archive::new(GzDecoder::new(file));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["db_app.dump", "globals.sql", "metadata.json"]);
    }

    #[test]
    fn test_sample_exclusion_is_stable() {
        let tables = vec!["users", "orders", "line_items", "audit"];
        let a: Vec<_> = tables.iter().filter(|t| !sample_keeps_table(t, 4)).collect();
        let b: Vec<_> = tables.iter().filter(|t| !sample_keeps_table(t, 4)).collect();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_failed_local_publish_removes_partial_payload() {
        let sink = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let name = "db_app_20260101_000000.dump";

        let body = b"PGDMP bytes".to_vec();
        let payload_path = staging.path().join(name);
        tokio::fs::write(&payload_path, &body).await.unwrap();

        // Occupy the checksum sidecar's name with a directory so the triple
        // write fails after the payload has landed in the sink.
        tokio::fs::create_dir(sink.path().join(format!("{}.sha256", name)))
            .await
            .unwrap();

        let mut config = crate::config::Config::default();
        config.backup.backup_dir = sink.path().to_path_buf();
        let mut ctx = crate::test_support::test_context();
        ctx.config = Arc::new(config);

        let artifact = BackupArtifact {
            backup_id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            engine: ctx.adapter.engine(),
            scope: Scope::Single,
            format: ArtifactFormat::EngineCustom,
            created_at: Utc::now(),
            size_bytes_ciphertext: body.len() as u64,
            size_bytes_plaintext_declared: body.len() as u64,
            sha256: "0".repeat(64),
            compression_algo: "none".to_string(),
            compression_level: 0,
            encryption: EncryptionMode::None,
            encryption_header_offset: None,
            databases: vec!["app".to_string()],
            backup_type: BackupKind::Full,
            parent_ref: None,
            tool_version: BackupArtifact::tool_version(),
            hostname: None,
        };

        let result = publish_everywhere(&ctx, name, &payload_path, &artifact).await;
        assert!(result.is_err());
        assert!(!sink.path().join(name).exists());
        assert!(!sink.path().join(format!("{}.info", name)).exists());
    }
}
