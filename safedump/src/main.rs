//! Safedump - command-line entry point.

use clap::{Parser, Subcommand};
use safedump::artifact;
use safedump::backup;
use safedump::config::{Config, Overrides};
use safedump::context::OpContext;
use safedump::crypto::KeySource;
use safedump::engine::{open_adapter, ConnectionConfig, Engine};
use safedump::error::SafedumpError;
use safedump::metrics::SessionMetrics;
use safedump::pitr::{self, RecoveryTarget};
use safedump::process::ProcessManager;
use safedump::restore::{self, RestoreReport};
use safedump::retention::{self, RetentionPolicy};
use safedump::store::{open_object, open_store, LocalStore, ObjectStore};
use safedump::{logging, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Streaming database backup and restore", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Local sink directory for backup artifacts
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    /// gzip level 0-9
    #[arg(long, global = true, value_parser = clap::value_parser!(u32).range(0..=9))]
    compression: Option<u32>,

    /// Parallel databases during cluster operations
    #[arg(long, global = true)]
    jobs: Option<usize>,

    /// Parallelism inside the dump/restore tool
    #[arg(long, global = true)]
    dump_jobs: Option<usize>,

    /// Cloud store URI, e.g. s3://bucket/prefix
    #[arg(long, global = true, value_name = "URI")]
    cloud: Option<String>,

    /// Encrypt backup payloads
    #[arg(long, global = true)]
    encrypt: bool,

    /// Path to a raw or base64 32-byte key file
    #[arg(long, global = true, value_name = "FILE")]
    encryption_key_file: Option<PathBuf>,

    /// Environment variable holding the key
    #[arg(long, global = true, value_name = "VAR")]
    encryption_key_env: Option<String>,

    /// Passphrase for key derivation
    #[arg(long, global = true, value_name = "PASSPHRASE")]
    encryption_key_passphrase: Option<String>,

    /// Database host; empty or localhost selects the local socket
    #[arg(long, global = true)]
    host: Option<String>,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(long, global = true)]
    user: Option<String>,

    /// Engine kind: postgres, mysql or mariadb
    #[arg(long, global = true)]
    engine: Option<String>,

    /// Reserved: fail runs on warning-class diagnostics (no effect yet)
    #[arg(long, global = true)]
    strict: bool,

    /// Skip the safety check before destructive operations
    #[arg(long, global = true)]
    confirm: bool,

    /// Compute the effect without side effects
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup
    Backup {
        #[command(subcommand)]
        scope: BackupScope,
    },
    /// Restore from a backup artifact
    Restore {
        #[command(subcommand)]
        scope: RestoreScope,
    },
    /// Apply the retention policy to a store
    Cleanup {
        /// Store URI (local://, s3://, minio://, b2://, blob://, chunk://)
        store_uri: String,
        #[arg(long)]
        retention_days: Option<u32>,
        #[arg(long)]
        min_backups: Option<usize>,
    },
    /// Verify a payload against its checksum sidecar
    Verify {
        /// Artifact path or store URI
        input: String,
    },
    /// List artifacts in a store
    List {
        /// Store URI; defaults to the local backup directory
        store_uri: Option<String>,
    },
    /// Point-in-time recovery (PostgreSQL)
    Pitr {
        #[command(subcommand)]
        action: PitrAction,
    },
}

#[derive(Subcommand, Debug)]
enum BackupScope {
    /// One database
    Single { database: String },
    /// A deterministic 1-in-N sample of one database
    Sample {
        database: String,
        #[arg(long, default_value_t = 10)]
        ratio: u32,
    },
    /// Every database of the instance, as one artifact
    Cluster,
}

#[derive(Subcommand, Debug)]
enum RestoreScope {
    /// One database from a payload path or URI
    Single {
        input: String,
        #[arg(long)]
        target: String,
        /// Create the target database instead of requiring it to exist
        #[arg(long)]
        create: bool,
    },
    /// A full cluster artifact
    Cluster { input: String },
}

#[derive(Subcommand, Debug)]
enum PitrAction {
    /// Configure WAL archiving
    Enable {
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Summarize the WAL archive
    Status {
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Trim the WAL archive to the newest segments
    Cleanup {
        #[arg(long, default_value_t = 64)]
        keep: usize,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
    },
    /// Write the recovery configuration for a target
    Recover {
        #[arg(long)]
        target_time: Option<String>,
        #[arg(long)]
        target_xid: Option<String>,
        #[arg(long)]
        target_lsn: Option<String>,
        #[arg(long)]
        target_name: Option<String>,
        #[arg(long)]
        target_immediate: bool,
        #[arg(long)]
        archive_dir: Option<PathBuf>,
        /// Where to write the recovery configuration
        #[arg(long, default_value = "safedump_recovery.conf")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let log_level = args.log_level.clone().unwrap_or_else(|| "info".to_string());
    if let Err(e) = logging::init(&log_level) {
        eprintln!("cannot initialize logging: {}", e);
        std::process::exit(1);
    }

    let code = match run(args).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{}", e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

/// 0 success, 1 operational failure, 2 usage error.
fn exit_code(e: &SafedumpError) -> i32 {
    match e {
        SafedumpError::Config(_) | SafedumpError::RecoveryTarget(_) | SafedumpError::InvalidUri(_) => 2,
        _ => 1,
    }
}

async fn run(args: Args) -> Result<()> {
    let overrides = Overrides {
        backup_dir: args.backup_dir.clone(),
        compression: args.compression,
        jobs: args.jobs,
        dump_jobs: args.dump_jobs,
        cloud_uri: args.cloud.clone(),
        encrypt: args.encrypt.then_some(true),
        key_file: args.encryption_key_file.clone(),
        key_env: args.encryption_key_env.clone(),
        host: args.host.clone(),
        port: args.port,
        user: args.user.clone(),
        engine: args.engine.clone(),
        strict: args.strict.then_some(true),
    };
    let config = Config::resolve(args.config.as_deref(), &overrides)
        .map_err(|e| SafedumpError::Config(e.to_string()))?;
    let engine: Engine = config.database.engine.parse()?;

    let manager = Arc::new(ProcessManager::new());
    let metrics = Arc::new(SessionMetrics::new());
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone(), Arc::clone(&manager));

    let key_material = resolve_key_material(&args, &config)?;
    let adapter = open_adapter(
        engine,
        ConnectionConfig::from_database(&config.database),
        Arc::clone(&manager),
    );
    let ctx = OpContext {
        config: Arc::new(config),
        adapter,
        manager: Arc::clone(&manager),
        metrics: Arc::clone(&metrics),
        cancel: cancel.clone(),
        key_material,
    };

    let result = dispatch(&args, &ctx).await;

    metrics.report();
    manager.sweep();

    if cancel.is_cancelled() {
        if let Ok(()) = result {
            return Err(SafedumpError::Cancelled);
        }
    }
    result
}

async fn dispatch(args: &Args, ctx: &OpContext) -> Result<()> {
    match &args.command {
        Command::Backup { scope } => {
            let outcome = match scope {
                BackupScope::Single { database } => backup::backup_single(ctx, database).await?,
                BackupScope::Sample { database, ratio } => {
                    backup::backup_sample(ctx, database, *ratio).await?
                }
                BackupScope::Cluster => backup::backup_cluster(ctx).await?,
            };
            println!(
                "{}  {} bytes  sha256 {}",
                outcome.payload_name, outcome.size_bytes, outcome.sha256
            );
            Ok(())
        }

        Command::Restore { scope } => {
            if !args.confirm {
                return Err(SafedumpError::Config(
                    "restore replaces existing data; pass --confirm to proceed".to_string(),
                ));
            }
            let report = match scope {
                RestoreScope::Single {
                    input,
                    target,
                    create,
                } => restore::restore_single(ctx, input, target, *create).await?,
                RestoreScope::Cluster { input } => restore::restore_cluster(ctx, input).await?,
            };
            print_restore_report(&report);
            if report.success() {
                Ok(())
            } else {
                Err(SafedumpError::Restore(
                    "one or more databases finished with critical diagnostics".to_string(),
                ))
            }
        }

        Command::Cleanup {
            store_uri,
            retention_days,
            min_backups,
        } => {
            let store = open_store(store_uri, &ctx.config.cloud).await?;
            let policy = RetentionPolicy {
                retention_days: retention_days.unwrap_or(ctx.config.backup.retention_days),
                min_backups: min_backups.unwrap_or(ctx.config.backup.min_backups),
            };
            let report = retention::apply(store.as_ref(), "", policy, args.dry_run).await?;
            println!(
                "{}: examined {}, kept {}, {} {}, {} failed",
                store.name(),
                report.examined,
                report.kept,
                if report.dry_run { "would delete" } else { "deleted" },
                report.deleted.len(),
                report.failed
            );
            Ok(())
        }

        Command::Verify { input } => {
            let (store, name) = locate_object(input, ctx).await?;
            let digest = artifact::verify(store.as_ref(), &name).await?;
            println!("{}: OK  sha256 {}", name, digest);
            Ok(())
        }

        Command::List { store_uri } => {
            let store: Arc<dyn ObjectStore> = match store_uri {
                Some(uri) => open_store(uri, &ctx.config.cloud).await?,
                None => Arc::new(LocalStore::new(ctx.config.backup.backup_dir.clone())),
            };
            let mut objects = store.list("").await?;
            objects.retain(|o| !artifact::is_sidecar(&o.name));
            objects.sort_by(|a, b| a.name.cmp(&b.name));
            for object in objects {
                let encrypted = match artifact::read_metadata(store.as_ref(), &object.name).await {
                    Ok(meta) => {
                        use safedump::artifact::EncryptionMode;
                        if meta.encryption == EncryptionMode::None { "plain" } else { "encrypted" }
                    }
                    Err(_) => "unknown",
                };
                let age = object
                    .mtime
                    .map(|m| format!("{}d", (chrono::Utc::now() - m).num_days()))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:>12}  {:>6}  {:>9}  {}", object.size, age, encrypted, object.name);
            }
            Ok(())
        }

        Command::Pitr { action } => {
            let default_archive = ctx.config.backup.backup_dir.join("wal_archive");
            match action {
                PitrAction::Enable { archive_dir } => {
                    pitr::enable(ctx, archive_dir.as_deref().unwrap_or(&default_archive)).await
                }
                PitrAction::Status { archive_dir } => {
                    let dir = archive_dir.as_deref().unwrap_or(&default_archive);
                    let status = pitr::status(dir).await?;
                    println!(
                        "{}: {} segment(s), {} bytes, oldest {}, newest {}",
                        dir.display(),
                        status.segments,
                        status.total_bytes,
                        status.oldest.as_deref().unwrap_or("-"),
                        status.newest.as_deref().unwrap_or("-")
                    );
                    Ok(())
                }
                PitrAction::Cleanup { keep, archive_dir } => {
                    let dir = archive_dir.as_deref().unwrap_or(&default_archive);
                    let removed = pitr::cleanup(dir, *keep, args.dry_run).await?;
                    println!(
                        "{} segment(s) {}",
                        removed,
                        if args.dry_run { "would be removed" } else { "removed" }
                    );
                    Ok(())
                }
                PitrAction::Recover {
                    target_time,
                    target_xid,
                    target_lsn,
                    target_name,
                    target_immediate,
                    archive_dir,
                    output,
                } => {
                    let target = RecoveryTarget::from_flags(
                        target_time.clone(),
                        target_xid.clone(),
                        target_lsn.clone(),
                        target_name.clone(),
                        *target_immediate,
                    )?;
                    let dir = archive_dir.as_deref().unwrap_or(&default_archive);
                    let written = pitr::recover(ctx, dir, &target, output).await?;
                    println!("recovery configuration written to {}", written.display());
                    Ok(())
                }
            }
        }
    }
}

fn print_restore_report(report: &RestoreReport) {
    for db in &report.databases {
        println!(
            "{}: {}  (ignorable {}, warning {}, critical {}, fatal {})",
            db.database,
            if db.ok { "ok" } else { "FAILED" },
            db.tally.ignorable,
            db.tally.warning,
            db.tally.critical,
            db.tally.fatal
        );
    }
}

/// Pick the key source: explicit passphrase, then key file, then key
/// variable. Flags already won over the config file during resolve.
fn resolve_key_material(args: &Args, config: &Config) -> Result<Option<Arc<Vec<u8>>>> {
    let source = if let Some(passphrase) = &args.encryption_key_passphrase {
        KeySource::Passphrase(passphrase.clone())
    } else if let Some(file) = &config.encryption.key_file {
        KeySource::File(file.clone())
    } else if let Some(var) = &config.encryption.key_env {
        KeySource::Env(var.clone())
    } else {
        return Ok(None);
    };
    Ok(Some(Arc::new(source.material()?)))
}

/// Interrupts cancel the root token and fan SIGTERM out to every
/// registered engine subprocess.
fn spawn_signal_handler(cancel: CancellationToken, manager: Arc<ProcessManager>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("cannot install SIGTERM handler: {}", e);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        warn!("interrupt received; cancelling and terminating child processes");
        cancel.cancel();
        manager.terminate_all();
    });
}

/// Resolve an artifact argument (path or URI) to a store and object name.
async fn locate_object(input: &str, ctx: &OpContext) -> Result<(Arc<dyn ObjectStore>, String)> {
    if safedump::store::is_store_uri(input) {
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
