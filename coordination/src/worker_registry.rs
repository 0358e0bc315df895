//! Worker registry: instance registration, heartbeats, stale-claim
//! reclamation, and the project-scoped exclusive lock that keeps two
//! executor daemons from running against the same project at once.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::issue_store::{IssueStore, WorkerInstance, WorkerStatus};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to acquire exclusive lock at {path}: {reason}")]
    LockAcquisitionFailed { path: PathBuf, reason: String },

    #[error("worker registration failed: {0}")]
    RegistrationFailed(String),

    #[error("issue store error: {0}")]
    Store(#[from] crate::issue_store::IssueStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Contents of the `.beads/.exclusive-lock` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub holder: String,
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

/// RAII guard for the project lock: removes the lock file on drop unless
/// the process is exiting abnormally, in which case the stale file is left
/// for the next start to reap.
pub struct ProjectLock {
    path: PathBuf,
    released: bool,
}

impl ProjectLock {
    fn probe_alive(pid: u32) -> bool {
        // Best-effort liveness probe: POSIX kill(pid, 0) without actually
        // signalling the process. Unsupported platforms assume alive so we
        // never steal a lock we can't verify is abandoned.
        #[cfg(unix)]
        {
            // SAFETY: signal 0 performs existence/permission checks only;
            // it does not affect the target process.
            unsafe { libc::kill(pid as i32, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            true
        }
    }

    /// Acquire the project lock at `path`, stealing it if the recorded PID
    /// is confirmed dead on this host.
    pub fn acquire(path: impl AsRef<Path>, holder: &str) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let hostname = hostname();
        let pid = std::process::id();

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(lock) = serde_json::from_str::<LockFile>(&existing) {
                let same_host = lock.hostname == hostname;
                if !same_host || Self::probe_alive(lock.pid) {
                    return Err(RegistryError::LockAcquisitionFailed {
                        path,
                        reason: format!(
                            "held by {} (pid {}) on {}",
                            lock.holder, lock.pid, lock.hostname
                        ),
                    });
                }
                tracing::warn!(stale_pid = lock.pid, "stealing stale project lock");
            }
        }

        let lock = LockFile {
            holder: holder.to_string(),
            pid,
            hostname,
            started_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&lock)?)?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn release(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    })
}

/// Registry operations layered over the [`IssueStore`] worker table.
pub struct WorkerRegistry {
    store: Arc<dyn IssueStore>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn IssueStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, worker_id: &str) -> Result<WorkerInstance, RegistryError> {
        let now = Utc::now();
        let instance = WorkerInstance {
            worker_id: worker_id.to_string(),
            hostname: hostname(),
            pid: std::process::id(),
            started_at: now,
            last_heartbeat_at: now,
            status: WorkerStatus::Running,
        };
        self.store
            .register_worker(instance.clone())
            .await
            .map_err(|e| RegistryError::RegistrationFailed(e.to_string()))?;
        Ok(instance)
    }

    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), RegistryError> {
        self.store.heartbeat_worker(worker_id, Utc::now()).await?;
        Ok(())
    }

    pub async fn list_active(&self) -> Result<Vec<WorkerInstance>, RegistryError> {
        Ok(self.store.list_active_workers().await?)
    }

    /// Mark heartbeat-expired instances stopped and release any claims
    /// they held back to the ready pool.
    pub async fn reap_stale(&self, threshold: Duration) -> Result<Vec<WorkerInstance>, RegistryError> {
        let reaped = self.store.cleanup_stale_workers(threshold).await?;
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), "reaped stale worker instances");
        }
        Ok(reaped)
    }

    pub async fn gc_stopped(&self, older_than: Duration) -> Result<usize, RegistryError> {
        Ok(self.store.delete_old_stopped_workers(older_than).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".exclusive-lock");

        let mut lock = ProjectLock::acquire(&path, "worker-1").unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());

        let _lock2 = ProjectLock::acquire(&path, "worker-2").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn acquire_fails_while_a_live_process_holds_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".exclusive-lock");
        let lock = LockFile {
            holder: "other".into(),
            pid: std::process::id(),
            hostname: hostname(),
            started_at: Utc::now(),
            version: "0.1.0".into(),
        };
        std::fs::write(&path, serde_json::to_string(&lock).unwrap()).unwrap();

        let result = ProjectLock::acquire(&path, "me");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn register_and_heartbeat_round_trip() {
        let store: Arc<dyn IssueStore> = Arc::new(crate::issue_store::memory::InMemoryIssueStore::new());
        let registry = WorkerRegistry::new(store);
        registry.register("worker-1").await.unwrap();
        registry.heartbeat("worker-1").await.unwrap();
        let active = registry.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
    }
}
