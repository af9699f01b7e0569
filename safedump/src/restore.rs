//! Restore orchestration.
//!
//! Cluster restore runs a fixed sequence: pre-flight (stage, decrypt,
//! unpack, plan), globals SQL, per-database drop/create/restore under the
//! concurrency policy, then a report. Databases whose archive contains
//! large objects force the whole run sequential, because overlapping
//! large-object restores exhaust the server's lock table.
//!
//! Restore tools run without single-transaction and without exit-on-error:
//! each object restores in its own transaction so locks release
//! incrementally, and termination is decided by the diagnostic classifier
//! rather than the tool's exit code.

use crate::artifact::{self, read_metadata};
use crate::classify::DiagnosticTally;
use crate::context::OpContext;
use crate::crypto::{self, is_encrypted, DecryptingReader, Header, HEADER_LEN};
use crate::engine::{scan_diagnostics, RestoreOptions};
use crate::error::{Result, SafedumpError};
use crate::metrics::OperationOutcome;
use crate::pipeline::{self, copy_cancellable, HashingReader};
use crate::retry::cancellable_sleep;
use crate::store::{open_object, LocalStore, ObjectStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Wait between terminating foreign connections and dropping the
/// database, so backends finish their cleanup.
const POST_TERMINATE_WAIT: Duration = Duration::from_millis(500);

/// Parent-chain resolution cap for incremental artifacts.
const MAX_CHAIN_DEPTH: usize = 32;

/// One per-database restore job derived from a cluster archive.
#[derive(Debug)]
pub struct RestoreJob {
    pub database: String,
    pub dump_path: PathBuf,
    pub size_bytes: u64,
    pub has_large_objects: bool,
}

/// The plan computed during pre-flight.
#[derive(Debug)]
pub struct RestorePlan {
    pub globals: Option<PathBuf>,
    pub jobs: Vec<RestoreJob>,
}

impl RestorePlan {
    /// Large-object restores hold many locks; overlapping them across
    /// databases exhausts the lock table, so any such entry degrades the
    /// run to sequential.
    pub fn effective_parallelism(&self, configured: usize) -> usize {
        if self.jobs.iter().any(|j| j.has_large_objects) {
            1
        } else {
            configured.max(1)
        }
    }
}

#[derive(Debug)]
pub struct DatabaseReport {
    pub database: String,
    pub tally: DiagnosticTally,
    pub ok: bool,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub databases: Vec<DatabaseReport>,
    pub effective_jobs: usize,
}

impl RestoreReport {
    pub fn success(&self) -> bool {
        self.databases.iter().all(|d| d.ok)
    }
}

/// Restore a full cluster artifact (local path or store URI).
pub async fn restore_cluster(ctx: &OpContext, input: &str) -> Result<RestoreReport> {
    let started = std::time::Instant::now();
    ctx.metrics.operation_started();
    let result = restore_cluster_inner(ctx, input).await;

    let outcome = match &result {
        Ok(report) if report.success() => OperationOutcome::Completed,
        Ok(_) => OperationOutcome::Failed,
        Err(SafedumpError::Cancelled) => OperationOutcome::Aborted,
        Err(_) => OperationOutcome::Failed,
    };
    ctx.metrics
        .record_operation("restore-cluster", None, outcome, started.elapsed());
    result
}

async fn restore_cluster_inner(ctx: &OpContext, input: &str) -> Result<RestoreReport> {
    // PreFlight: stage, decrypt, unpack and plan.
    let workspace = tempfile::tempdir()?;
    let staged = stage_input(ctx, input, workspace.path()).await?;
    let plain = prepare_plaintext(ctx, &staged, workspace.path()).await?;

    let extract_dir = workspace.path().join("archive");
    tokio::fs::create_dir_all(&extract_dir).await?;
    extract_archive(plain.clone(), extract_dir.clone()).await?;

    let plan = build_plan(ctx, &extract_dir).await?;
    if plan.jobs.is_empty() {
        return Err(SafedumpError::Restore(
            "archive contains no database dumps".to_string(),
        ));
    }

    let superuser = ctx.adapter.is_superuser().await.unwrap_or(false);
    if !superuser {
        warn!("connected role is not a superuser; ownership and privileges will be reassigned to the restoring role");
    }

    let effective = plan.effective_parallelism(ctx.config.backup.jobs);
    if effective < ctx.config.backup.jobs.max(1) {
        info!(
            "archive contains large objects; restoring sequentially instead of {} jobs",
            ctx.config.backup.jobs
        );
    }

    // Globals run to completion before any per-database step.
    if let Some(globals) = &plan.globals {
        info!("restoring cluster globals");
        let tally = ctx.adapter.run_sql_script("postgres", globals).await?;
        if tally.fatal > 0 {
            return Err(SafedumpError::Restore(
                "fatal diagnostics while restoring globals".to_string(),
            ));
        }
        if !tally.is_success() {
            warn!("globals restore reported problems: {:?}", tally);
        }
    }

    let options = RestoreOptions {
        jobs: ctx.config.backup.dump_jobs,
        no_owner: !superuser,
        no_privileges: !superuser,
        ..Default::default()
    };

    let semaphore = Arc::new(Semaphore::new(effective));
    let mut tasks: JoinSet<Result<DatabaseReport>> = JoinSet::new();
    for job in plan.jobs {
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        let options = options.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| SafedumpError::Cancelled)?;
            if ctx.cancel.is_cancelled() {
                return Err(SafedumpError::Cancelled);
            }
            restore_one_database(&ctx, &job, &options).await
        });
    }

    let mut report = RestoreReport {
        effective_jobs: effective,
        ..Default::default()
    };
    let mut first_error: Option<SafedumpError> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(db_report)) => report.databases.push(db_report),
            Ok(Err(e)) => {
                if first_error.is_none() {
                    // Fatal problems cancel the remaining workers.
                    ctx.cancel.cancel();
                    first_error = Some(e);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    ctx.cancel.cancel();
                    first_error = Some(SafedumpError::Restore(format!(
                        "restore worker panicked: {}",
                        join_err
                    )));
                }
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    report.databases.sort_by(|a, b| a.database.cmp(&b.database));
    for db in &report.databases {
        info!(
            database = %db.database,
            ok = db.ok,
            ignorable = db.tally.ignorable,
            warning = db.tally.warning,
            critical = db.tally.critical,
            fatal = db.tally.fatal,
            "database restore finished"
        );
    }
    Ok(report)
}

/// One per-database step: terminate foreign connections, wait, drop,
/// create from the empty template, then run the restore tool. System
/// databases keep their drop and create skipped. Re-running after a
/// partial failure is safe because drop+create erases partial state.
async fn restore_one_database(
    ctx: &OpContext,
    job: &RestoreJob,
    options: &RestoreOptions,
) -> Result<DatabaseReport> {
    let db = &job.database;
    info!(
        "restoring {} ({} bytes{})",
        db,
        job.size_bytes,
        if job.has_large_objects { ", large objects" } else { "" }
    );

    ctx.adapter.terminate_other_connections(db).await?;
    if !cancellable_sleep(POST_TERMINATE_WAIT, &ctx.cancel).await {
        return Err(SafedumpError::Cancelled);
    }
    ctx.adapter.drop_database(db).await?;
    ctx.adapter.create_database(db).await?;

    let tally = run_restore_tool(ctx, db, &job.dump_path, options).await?;
    if tally.fatal > 0 {
        return Err(SafedumpError::Restore(format!(
            "{}: fatal diagnostics during restore",
            db
        )));
    }
    Ok(DatabaseReport {
        database: db.clone(),
        ok: tally.is_success(),
        tally,
    })
}

/// Restore a single-database artifact into `target`. Incremental deltas
/// resolve their parent chain and apply base first.
pub async fn restore_single(
    ctx: &OpContext,
    input: &str,
    target: &str,
    create: bool,
) -> Result<RestoreReport> {
    let started = std::time::Instant::now();
    ctx.metrics.operation_started();
    let result = restore_single_inner(ctx, input, target, create).await;

    let outcome = match &result {
        Ok(report) if report.success() => OperationOutcome::Completed,
        Ok(_) => OperationOutcome::Failed,
        Err(SafedumpError::Cancelled) => OperationOutcome::Aborted,
        Err(_) => OperationOutcome::Failed,
    };
    ctx.metrics
        .record_operation("restore-single", Some(target), outcome, started.elapsed());
    result
}

async fn restore_single_inner(
    ctx: &OpContext,
    input: &str,
    target: &str,
    create: bool,
) -> Result<RestoreReport> {
    let (store, name) = locate(ctx, input).await?;

    // Walk parent_ref back to the base, then apply base first.
    let mut chain = vec![name.clone()];
    let mut cursor = name.clone();
    for _ in 0..MAX_CHAIN_DEPTH {
        match read_metadata(store.as_ref(), &cursor).await {
            Ok(meta) => match meta.parent_ref {
                Some(parent) => {
                    if chain.contains(&parent) {
                        return Err(SafedumpError::InvalidMetadata(format!(
                            "parent chain of {} contains a cycle",
                            name
                        )));
                    }
                    chain.insert(0, parent.clone());
                    cursor = parent;
                }
                None => break,
            },
            Err(SafedumpError::NotFound(_)) => {
                debug!("{}: no metadata sidecar; treating as standalone", cursor);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    if chain.len() > 1 {
        info!("applying incremental chain of {} artifacts", chain.len());
    }

    if create {
        ctx.adapter.create_database(target).await?;
    } else if !ctx.adapter.list_databases().await?.iter().any(|d| d == target) {
        return Err(SafedumpError::Restore(format!(
            "target database {} does not exist; pass --create to create it",
            target
        )));
    }

    let superuser = ctx.adapter.is_superuser().await.unwrap_or(false);
    if !superuser {
        warn!("connected role is not a superuser; ownership and privileges will be reassigned to the restoring role");
    }
    let options = RestoreOptions {
        jobs: ctx.config.backup.dump_jobs,
        no_owner: !superuser,
        no_privileges: !superuser,
        ..Default::default()
    };

    let mut total = DiagnosticTally::default();
    for payload_name in &chain {
        let workspace = tempfile::tempdir()?;
        let staged = stage_object(ctx, store.as_ref(), payload_name, workspace.path()).await?;
        let plain = prepare_plaintext(ctx, &staged, workspace.path()).await?;

        let tally = if payload_name.ends_with(".tar.gz") {
            return Err(SafedumpError::Restore(format!(
                "{} is a cluster artifact; use restore cluster",
                payload_name
            )));
        } else if payload_name.ends_with(".sql.gz") {
            let sql_path = workspace.path().join("payload.sql");
            let file = tokio::fs::File::open(&plain).await?;
            let mut decoded = pipeline::gzip_decode(file);
            pipeline::run_to_file(&mut decoded, &sql_path, &ctx.cancel).await?;
            ctx.adapter.run_sql_script(target, &sql_path).await?
        } else {
            run_restore_tool(ctx, target, &plain, &options).await?
        };

        if tally.fatal > 0 {
            return Err(SafedumpError::Restore(format!(
                "{}: fatal diagnostics during restore",
                payload_name
            )));
        }
        total.merge(&tally);
    }

    Ok(RestoreReport {
        effective_jobs: 1,
        databases: vec![DatabaseReport {
            database: target.to_string(),
            ok: total.is_success(),
            tally: total,
        }],
    })
}

/// Spawn the restore tool on a seekable dump file, scanning diagnostics,
/// under the per-database timeout. A non-zero exit with a clean tally is
/// only a warning; pg_restore exits non-zero for ignorable duplicates too.
async fn run_restore_tool(
    ctx: &OpContext,
    db: &str,
    dump_path: &Path,
    options: &RestoreOptions,
) -> Result<DiagnosticTally> {
    let mut proc = ctx.adapter.start_restore(db, dump_path, options)?;
    let stderr = proc.take_stderr()?;

    // One deadline covers both the diagnostic scan and the tool's exit; a
    // tool that closes stderr but never exits still gets killed.
    let deadline = tokio::time::Instant::now() + ctx.timeout();
    let work = async {
        tokio::select! {
            tally = scan_diagnostics(stderr, db) => tally,
            _ = ctx.cancel.cancelled() => Err(SafedumpError::Cancelled),
        }
    };
    let tally = match tokio::time::timeout_at(deadline, work).await {
        Ok(Ok(tally)) => tally,
        Ok(Err(e)) => {
            proc.kill().await;
            return Err(e);
        }
        Err(_) => {
            proc.kill().await;
            return Err(SafedumpError::Timeout(ctx.config.backup.timeout_minutes));
        }
    };

    let status = wait_within(deadline, &mut proc, ctx.config.backup.timeout_minutes).await?;
    if !status.success() {
        if tally.is_success() {
            warn!(
                "{}: restore tool exited with {} but diagnostics were clean",
                db, status
            );
        } else {
            debug!("{}: restore tool exited with {}", db, status);
        }
    }
    Ok(tally)
}

/// Wait for the tool to exit within the remaining deadline; kill it on
/// overrun.
async fn wait_within(
    deadline: tokio::time::Instant,
    proc: &mut crate::engine::ToolProcess,
    timeout_minutes: u64,
) -> Result<std::process::ExitStatus> {
    match tokio::time::timeout_at(deadline, proc.wait()).await {
        Ok(status) => status,
        Err(_) => {
            proc.kill().await;
            Err(SafedumpError::Timeout(timeout_minutes))
        }
    }
}

/// Resolve an input to a store plus object name. Local paths become a
/// local store rooted at the parent directory.
async fn locate(ctx: &OpContext, input: &str) -> Result<(Arc<dyn ObjectStore>, String)> {
    if crate::store::is_store_uri(input) {
        return open_object(input, &ctx.config.cloud).await;
    }
    let path = Path::new(input);
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SafedumpError::InvalidUri(format!("not a file path: {}", input)))?
        .to_string();
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((Arc::new(LocalStore::new(parent.to_path_buf())), name))
}

/// Stage an input (URI or path) into the workspace. Restore tools need a
/// seekable local file, so every payload streams through disk and past the
/// integrity check on the way.
async fn stage_input(ctx: &OpContext, input: &str, workspace: &Path) -> Result<PathBuf> {
    let (store, name) = locate(ctx, input).await?;
    stage_object(ctx, store.as_ref(), &name, workspace).await
}

/// Copy an object to the workspace, hashing it in transit, and compare the
/// digest against the checksum sidecar before anything consumes the copy.
async fn stage_object(
    ctx: &OpContext,
    store: &dyn ObjectStore,
    name: &str,
    workspace: &Path,
) -> Result<PathBuf> {
    let staged = workspace.join("staged.payload");
    let reader = store.get(name).await?;
    let (mut hashing, digest) = HashingReader::new(reader);
    let mut file = tokio::fs::File::create(&staged).await?;
    let bytes = copy_cancellable(&mut hashing, &mut file, &ctx.cancel).await?;
    file.sync_all().await?;
    debug!("staged {} ({} bytes) from {}", name, bytes, store.name());
    check_staged_digest(store, name, &digest.hex()).await?;
    Ok(staged)
}

/// Verify a staged payload against its `.sha256` sidecar. A payload with no
/// sidecar restores unchecked; a digest mismatch is a data-integrity
/// failure and aborts the whole operation.
async fn check_staged_digest(store: &dyn ObjectStore, name: &str, actual: &str) -> Result<()> {
    let mut reader = match store.get(&artifact::checksum_name(name)).await {
        Ok(reader) => reader,
        Err(SafedumpError::NotFound(_)) => {
            debug!("{}: no checksum sidecar; skipping integrity check", name);
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    let mut body = String::new();
    reader.read_to_string(&mut body).await?;
    let (expected, _) = artifact::parse_checksum_body(&body)?;
    if actual != expected {
        return Err(SafedumpError::Integrity(format!(
            "{}: checksum mismatch (expected {}, got {})",
            name, expected, actual
        )));
    }
    debug!("{}: checksum verified", name);
    Ok(())
}

/// Engage decryption when the payload starts with the encryption magic;
/// otherwise hand back the input unchanged.
async fn prepare_plaintext(ctx: &OpContext, input: &Path, workspace: &Path) -> Result<PathBuf> {
    let mut file = tokio::fs::File::open(input).await?;
    let mut head = [0u8; HEADER_LEN];
    let peeked = read_up_to(&mut file, &mut head).await?;
    if peeked < 16 || !is_encrypted(&head[..16]) {
        return Ok(input.to_path_buf());
    }
    if peeked < HEADER_LEN {
        return Err(SafedumpError::Crypto(
            "encrypted payload truncated inside header".to_string(),
        ));
    }

    let header = Header::parse(&head)?;
    let material = ctx.require_key()?;
    let (key, _mode) = crypto::resolve_key(material, &header.salt);

    let out = workspace.join("plaintext.payload");
    let mut decrypting = DecryptingReader::new(file, &key, &header);
    let mut sink = tokio::fs::File::create(&out).await?;
    copy_cancellable(&mut decrypting, &mut sink, &ctx.cancel).await?;
    sink.sync_all().await?;
    info!("decrypted payload {}", input.display());
    Ok(out)
}

async fn read_up_to<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Unpack a cluster tar.gz into `dest`.
async fn extract_archive(archive_path: PathBuf, dest: PathBuf) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        let file = std::fs::File::open(&archive_path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(&dest)?;
        Ok(())
    })
    .await
    .map_err(|e| SafedumpError::Restore(format!("archive extraction task failed: {}", e)))?
}

/// Walk the extracted archive and compute the restore plan: globals.sql if
/// present, one job per db_<name>.dump, each flagged for large objects by
/// its table of contents.
async fn build_plan(ctx: &OpContext, extract_dir: &Path) -> Result<RestorePlan> {
    let globals = {
        let path = extract_dir.join("globals.sql");
        path.is_file().then_some(path)
    };

    let mut jobs = Vec::new();
    let mut entries = tokio::fs::read_dir(extract_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(database) = file_name
            .strip_prefix("db_")
            .and_then(|rest| rest.strip_suffix(".dump"))
        else {
            continue;
        };

        let size_bytes = entry.metadata().await?.len();
        let toc = match ctx.adapter.inspect_dump_toc(&path).await {
            Ok(toc) => toc,
            Err(e) => {
                warn!("{}: cannot inspect table of contents: {}", database, e);
                Default::default()
            }
        };
        if toc.has_large_objects() {
            info!(
                "{}: {} large object(s) in archive",
                database, toc.large_objects
            );
        }
        jobs.push(RestoreJob {
            database: database.to_string(),
            dump_path: path,
            size_bytes,
            has_large_objects: toc.has_large_objects(),
        });
    }

    jobs.sort_by(|a, b| a.database.cmp(&b.database));
    Ok(RestorePlan { globals, jobs })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(db: &str, large: bool) -> RestoreJob {
        RestoreJob {
            database: db.to_string(),
            dump_path: PathBuf::from(format!("/tmp/db_{}.dump", db)),
            size_bytes: 1024,
            has_large_objects: large,
        }
    }

    #[test]
    fn test_large_objects_force_sequential() {
        let plan = RestorePlan {
            globals: None,
            jobs: vec![job("a", false), job("main", true), job("b", false)],
        };
        assert_eq!(plan.effective_parallelism(8), 1);
    }

    #[test]
    fn test_parallelism_preserved_without_large_objects() {
        let plan = RestorePlan {
            globals: None,
            jobs: vec![job("a", false), job("b", false)],
        };
        assert_eq!(plan.effective_parallelism(4), 4);
        assert_eq!(plan.effective_parallelism(0), 1);
    }

    #[test]
    fn test_report_success_requires_every_database() {
        let mut report = RestoreReport {
            effective_jobs: 1,
            databases: vec![DatabaseReport {
                database: "a".to_string(),
                tally: DiagnosticTally::default(),
                ok: true,
            }],
        };
        assert!(report.success());
        report.databases.push(DatabaseReport {
            database: "b".to_string(),
            tally: DiagnosticTally::default(),
            ok: false,
        });
        assert!(!report.success());
    }

    #[tokio::test]
    async fn test_plaintext_passthrough_without_magic() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain.dump");
        tokio::fs::write(&input, b"PGDMP plain bytes").await.unwrap();

        let ctx = crate::test_support::test_context();
        let out = prepare_plaintext(&ctx, &input, dir.path()).await.unwrap();
        assert_eq!(out, input);
    }

    fn gzip_bytes(content: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap()
    }

    fn published_artifact(name: &str, payload: &[u8]) -> crate::artifact::BackupArtifact {
        use crate::artifact::{ArtifactFormat, BackupArtifact, BackupKind, EncryptionMode, Scope};
        use sha2::{Digest, Sha256};
        BackupArtifact {
            backup_id: uuid::Uuid::new_v4(),
            name: name.to_string(),
            engine: crate::engine::Engine::Postgres,
            scope: Scope::Single,
            format: ArtifactFormat::PlainSqlGz,
            created_at: chrono::Utc::now(),
            size_bytes_ciphertext: payload.len() as u64,
            size_bytes_plaintext_declared: payload.len() as u64,
            sha256: format!("{:x}", Sha256::digest(payload)),
            compression_algo: "gzip".to_string(),
            compression_level: 6,
            encryption: EncryptionMode::None,
            encryption_header_offset: None,
            databases: vec!["app".to_string()],
            backup_type: BackupKind::Full,
            parent_ref: None,
            tool_version: BackupArtifact::tool_version(),
            hostname: None,
        }
    }

    #[tokio::test]
    async fn test_restore_single_rejects_tampered_payload() {
        let sink = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let name = "db_app_20260101_000000.sql.gz";

        let original = gzip_bytes(b"CREATE TABLE users (id int);\n");
        let payload_path = staging.path().join(name);
        tokio::fs::write(&payload_path, &original).await.unwrap();

        let store = LocalStore::new(sink.path().to_path_buf());
        let art = published_artifact(name, &original);
        crate::artifact::publish_triple(&store, name, &payload_path, &art)
            .await
            .unwrap();

        // Corrupt the stored payload after publication; the sidecar still
        // records the original digest.
        let tampered = gzip_bytes(b"DROP TABLE users;\n");
        tokio::fs::write(sink.path().join(name), &tampered)
            .await
            .unwrap();

        let ctx = crate::test_support::test_context();
        let input = sink.path().join(name);
        let err = restore_single(&ctx, input.to_str().unwrap(), "app", true)
            .await
            .unwrap_err();
        assert!(matches!(err, SafedumpError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_restore_single_accepts_intact_payload() {
        let sink = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let name = "db_app_20260101_000000.sql.gz";

        let payload = gzip_bytes(b"CREATE TABLE users (id int);\n");
        let payload_path = staging.path().join(name);
        tokio::fs::write(&payload_path, &payload).await.unwrap();

        let store = LocalStore::new(sink.path().to_path_buf());
        let art = published_artifact(name, &payload);
        crate::artifact::publish_triple(&store, name, &payload_path, &art)
            .await
            .unwrap();

        let ctx = crate::test_support::test_context();
        let input = sink.path().join(name);
        let report = restore_single(&ctx, input.to_str().unwrap(), "app", true)
            .await
            .unwrap();
        assert!(report.success());
    }

    #[tokio::test]
    async fn test_non_superuser_forces_owner_and_privilege_drop() {
        let staging = tempfile::tempdir().unwrap();
        let payload = staging.path().join("db_app_20260101_000000.dump");
        tokio::fs::write(&payload, b"PGDMP custom bytes").await.unwrap();

        let adapter = Arc::new(crate::test_support::StubAdapter {
            superuser: false,
            ..Default::default()
        });
        let ctx = crate::test_support::test_context_with(Arc::clone(&adapter));

        // The stub cannot spawn a restore tool, so the run fails after the
        // options are recorded.
        let result = restore_single(&ctx, payload.to_str().unwrap(), "app", false).await;
        assert!(result.is_err());

        let recorded = adapter.restore_options.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert!(recorded[0].no_owner);
        assert!(recorded[0].no_privileges);
    }

    #[tokio::test]
    async fn test_wait_within_kills_overrunning_tool() {
        let manager = Arc::new(crate::process::ProcessManager::new());
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("5")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        let mut proc = crate::engine::ToolProcess::spawn(&mut cmd, "sleep", manager).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_millis(100);
        let err = wait_within(deadline, &mut proc, 1).await.unwrap_err();
        assert!(matches!(err, SafedumpError::Timeout(1)));
    }
}
