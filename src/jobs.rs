//! Registry of running external tool jobs.
//!
//! A job is keyed by the artifact path its tool writes, so the caller that
//! named the artifact can also cancel it. The map sits behind one mutex and
//! every critical section is a single map operation; signalling a process
//! happens after the lock is released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("A job with id '{0}' is already running")]
    DuplicateJob(JobId),
    #[error("No running job with id '{0}'")]
    JobNotFound(JobId),
}

/// Identifier of one external tool invocation: the output artifact's file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from the artifact a job will produce.
    pub fn for_artifact(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle used to ask a running process to stop.
///
/// The runner keeps the `Child` itself; the registry only needs enough to
/// deliver a terminate signal from another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: Option<u32>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Request graceful termination (SIGTERM). Returns whether a signal was sent.
    #[cfg(unix)]
    pub fn terminate(&self) -> bool {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return false;
        };
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), Signal::SIGTERM) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Failed to signal process {}: {}", pid, e);
                false
            }
        }
    }

    /// Without POSIX signals the runner's own poll performs the stop.
    #[cfg(not(unix))]
    pub fn terminate(&self) -> bool {
        false
    }
}

/// Snapshot of one registered job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
}

#[derive(Debug)]
struct JobEntry {
    handle: ProcessHandle,
    cancelled: bool,
    started_at: DateTime<Utc>,
}

/// Thread-safe map from job id to running process and cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct JobRegistry {
    inner: Arc<Mutex<HashMap<JobId, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        // Entries are plain data, a panicking holder cannot leave them half-written.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, job_id: JobId, handle: ProcessHandle) -> Result<(), RegistryError> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&job_id) {
            return Err(RegistryError::DuplicateJob(job_id));
        }
        jobs.insert(
            job_id,
            JobEntry {
                handle,
                cancelled: false,
                started_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Remove a job. Unknown ids are ignored.
    pub fn unregister(&self, job_id: &JobId) {
        self.jobs().remove(job_id);
    }

    /// Mark a job cancelled and send its process a terminate signal.
    /// Does not wait for the process to exit.
    pub fn request_cancel(&self, job_id: &JobId) -> Result<(), RegistryError> {
        let handle = {
            let mut jobs = self.jobs();
            let entry = jobs
                .get_mut(job_id)
                .ok_or_else(|| RegistryError::JobNotFound(job_id.clone()))?;
            entry.cancelled = true;
            entry.handle
        };
        let signalled = handle.terminate();
        tracing::info!(job_id = %job_id, signalled, "Cancellation requested");
        Ok(())
    }

    pub fn is_cancelled(&self, job_id: &JobId) -> bool {
        self.jobs().get(job_id).map(|entry| entry.cancelled).unwrap_or(false)
    }

    pub fn contains(&self, job_id: &JobId) -> bool {
        self.jobs().contains_key(job_id)
    }

    pub fn snapshot(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self
            .jobs()
            .iter()
            .map(|(job_id, entry)| JobInfo {
                job_id: job_id.clone(),
                pid: entry.handle.pid(),
                started_at: entry.started_at,
                cancelled: entry.cancelled,
            })
            .collect();
        infos.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        infos
    }

    /// Register a job and get a guard that unregisters it when dropped.
    pub fn register_scoped(&self, job_id: JobId, handle: ProcessHandle) -> Result<JobGuard, RegistryError> {
        self.register(job_id.clone(), handle)?;
        Ok(JobGuard {
            registry: self.clone(),
            job_id,
        })
    }
}

/// Keeps a job registered for exactly as long as the guard lives.
#[derive(Debug)]
pub struct JobGuard {
    registry: JobRegistry,
    job_id: JobId,
}

impl JobGuard {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.registry.is_cancelled(&self.job_id)
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_register_and_unregister() {
        let registry = JobRegistry::new();
        let id = JobId::new("demo_withPPS.gcode");
        registry.register(id.clone(), ProcessHandle::new(None)).unwrap();
        assert!(registry.contains(&id));
        registry.unregister(&id);
        assert!(!registry.contains(&id));
        // Second unregister is a no-op
        registry.unregister(&id);
    }

    #[test]
    fn test_duplicate_register_fails() {
        let registry = JobRegistry::new();
        let id = JobId::new("a.gcode");
        registry.register(id.clone(), ProcessHandle::new(None)).unwrap();
        let err = registry.register(id.clone(), ProcessHandle::new(None)).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateJob(id));
    }

    #[test]
    fn test_cancel_unknown_job() {
        let registry = JobRegistry::new();
        let id = JobId::new("ghost.gcode");
        let err = registry.request_cancel(&id).unwrap_err();
        assert_eq!(err, RegistryError::JobNotFound(id.clone()));
        assert!(!registry.is_cancelled(&id));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_cancel_marks_job() {
        let registry = JobRegistry::new();
        let id = JobId::new("b.gcode");
        registry.register(id.clone(), ProcessHandle::new(None)).unwrap();
        assert!(!registry.is_cancelled(&id));
        registry.request_cancel(&id).unwrap();
        assert!(registry.is_cancelled(&id));
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].cancelled);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = JobRegistry::new();
        let id = JobId::new("c.stl");
        {
            let guard = registry.register_scoped(id.clone(), ProcessHandle::new(Some(1))).unwrap();
            assert_eq!(guard.job_id(), &id);
            assert!(registry.contains(&id));
        }
        assert!(!registry.contains(&id));
    }

    #[test]
    fn test_job_id_from_artifact_path() {
        let path = PathBuf::from("/srv/uploads/demo_tweaked.stl");
        assert_eq!(JobId::for_artifact(&path).as_str(), "demo_tweaked.stl");
    }
}
