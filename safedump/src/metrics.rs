//! Process-wide session metrics.
//!
//! Counters live for the lifetime of the process and are reported once at
//! exit. Byte counters are fed by the pipeline; operation records by the
//! orchestrators.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub name: String,
    pub database: Option<String>,
    pub outcome: OperationOutcome,
    pub wall_time_secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationOutcome {
    Completed,
    Failed,
    Aborted,
}

#[derive(Debug, Default)]
pub struct SessionMetrics {
    operations_started: AtomicU64,
    operations_completed: AtomicU64,
    operations_failed: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    records: Mutex<Vec<OperationRecord>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation_started(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_operation(
        &self,
        name: &str,
        database: Option<&str>,
        outcome: OperationOutcome,
        wall: Duration,
    ) {
        match outcome {
            OperationOutcome::Completed => {
                self.operations_completed.fetch_add(1, Ordering::Relaxed);
            }
            OperationOutcome::Failed | OperationOutcome::Aborted => {
                self.operations_failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let record = OperationRecord {
            name: name.to_string(),
            database: database.map(|d| d.to_string()),
            outcome,
            wall_time_secs: wall.as_secs_f64(),
        };
        let mut records = self.records.lock().expect("metrics mutex poisoned");
        records.push(record);
    }

    /// Log the session summary. Called once at process exit.
    pub fn report(&self) {
        let started = self.operations_started.load(Ordering::Relaxed);
        let completed = self.operations_completed.load(Ordering::Relaxed);
        let failed = self.operations_failed.load(Ordering::Relaxed);
        let bytes_in = self.bytes_in.load(Ordering::Relaxed);
        let bytes_out = self.bytes_out.load(Ordering::Relaxed);

        info!(
            started,
            completed, failed, bytes_in, bytes_out, "session summary"
        );

        let records = self.records.lock().expect("metrics mutex poisoned");
        for r in records.iter() {
            info!(
                operation = %r.name,
                database = r.database.as_deref().unwrap_or("-"),
                outcome = ?r.outcome,
                wall_secs = format!("{:.1}", r.wall_time_secs).as_str(),
                "operation"
            );
        }
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.operations_started.load(Ordering::Relaxed),
            self.operations_completed.load(Ordering::Relaxed),
            self.operations_failed.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_counts() {
        let m = SessionMetrics::new();
        m.operation_started();
        m.operation_started();
        m.record_operation(
            "backup",
            Some("app"),
            OperationOutcome::Completed,
            Duration::from_secs(3),
        );
        m.record_operation("restore", None, OperationOutcome::Failed, Duration::ZERO);

        assert_eq!(m.snapshot(), (2, 1, 1));
    }

    #[test]
    fn test_byte_counters() {
        let m = SessionMetrics::new();
        m.add_bytes_in(100);
        m.add_bytes_in(28);
        m.add_bytes_out(64);
        assert_eq!(m.bytes_in.load(Ordering::Relaxed), 128);
        assert_eq!(m.bytes_out.load(Ordering::Relaxed), 64);
    }
}
