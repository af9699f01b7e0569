//! Registry of spawned engine-tool processes.
//!
//! Every external tool (pg_dump, pg_restore, psql, mysqldump, ...) is
//! registered here so that cancellation can fan out to all children without
//! racing task teardown. The registry is swept at exit to report leaks.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::process::Child;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ProcessManager {
    children: Mutex<HashMap<u32, String>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly spawned child under a human-readable label.
    pub fn register(&self, child: &Child, label: &str) {
        if let Some(pid) = child.id() {
            let mut children = self.children.lock().expect("process registry poisoned");
            children.insert(pid, label.to_string());
            debug!("registered child {} ({})", pid, label);
        }
    }

    /// Remove a child after it has been reaped.
    pub fn unregister(&self, pid: u32) {
        let mut children = self.children.lock().expect("process registry poisoned");
        children.remove(&pid);
    }

    /// Send SIGTERM to every registered child. Used by the cancellation
    /// path; the owning tasks still reap the processes.
    pub fn terminate_all(&self) {
        let children = self.children.lock().expect("process registry poisoned");
        for (pid, label) in children.iter() {
            debug!("terminating child {} ({})", pid, label);
            if let Err(e) = kill(Pid::from_raw(*pid as i32), Signal::SIGTERM) {
                warn!("failed to signal child {} ({}): {}", pid, label, e);
            }
        }
    }

    pub fn running_count(&self) -> usize {
        self.children.lock().expect("process registry poisoned").len()
    }

    /// Report any children still registered. Called at exit.
    pub fn sweep(&self) {
        let children = self.children.lock().expect("process registry poisoned");
        for (pid, label) in children.iter() {
            warn!("leaked child process {} ({})", pid, label);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let mgr = ProcessManager::new();
        let child = tokio::process::Command::new("sleep")
            .arg("60")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().unwrap();

        mgr.register(&child, "sleep");
        assert_eq!(mgr.running_count(), 1);

        mgr.terminate_all();
        mgr.unregister(pid);
        assert_eq!(mgr.running_count(), 0);

        let mut child = child;
        let _ = child.wait().await;
    }
}
