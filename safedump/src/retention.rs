//! Time-and-count retention policy.
//!
//! Keeps the newest `max(min_backups, count-within-retention-window)`
//! artifacts under a prefix and deletes the rest, each as a full
//! payload/checksum/metadata triple. Individual deletion failures are
//! counted and logged; the sweep continues.

use crate::artifact::{self, is_sidecar};
use crate::error::Result;
use crate::store::ObjectStore;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    pub min_backups: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct RetentionReport {
    pub examined: usize,
    pub kept: usize,
    pub deleted: Vec<String>,
    pub failed: usize,
    pub dry_run: bool,
}

#[derive(Debug)]
struct Candidate {
    name: String,
    created_at: DateTime<Utc>,
}

/// Enumerate artifacts under `prefix`, resolve their creation times, and
/// apply the policy. With `dry_run` the deletion set is computed but
/// nothing is removed.
pub async fn apply(
    store: &dyn ObjectStore,
    prefix: &str,
    policy: RetentionPolicy,
    dry_run: bool,
) -> Result<RetentionReport> {
    let listed = store.list(prefix).await?;

    let mut candidates = Vec::new();
    for meta in &listed {
        if is_sidecar(&meta.name) {
            continue;
        }
        // created_at from the metadata sidecar; object mtime as fallback.
        let created_at = match artifact::read_metadata(store, &meta.name).await {
            Ok(m) => m.created_at,
            Err(_) => match meta.mtime {
                Some(mtime) => mtime,
                None => {
                    warn!("{}: no metadata and no mtime; skipping", meta.name);
                    continue;
                }
            },
        };
        candidates.push(Candidate {
            name: meta.name.clone(),
            created_at,
        });
    }

    candidates.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let cutoff = Utc::now() - Duration::days(policy.retention_days as i64);
    let within_window = candidates
        .iter()
        .filter(|c| c.created_at >= cutoff)
        .count();
    let keep = policy.min_backups.max(within_window);

    let mut report = RetentionReport {
        examined: candidates.len(),
        kept: keep.min(candidates.len()),
        dry_run,
        ..Default::default()
    };

    for victim in candidates.iter().skip(keep) {
        if dry_run {
            info!(
                artifact = %victim.name,
                created_at = %victim.created_at,
                "retention: would delete"
            );
            report.deleted.push(victim.name.clone());
            continue;
        }
        match artifact::delete_triple(store, &victim.name).await {
            Ok(()) => {
                info!(
                    artifact = %victim.name,
                    created_at = %victim.created_at,
                    store = store.name(),
                    "retention: deleted"
                );
                report.deleted.push(victim.name.clone());
            }
            Err(e) => {
                warn!("retention: failed to delete {}: {}", victim.name, e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
