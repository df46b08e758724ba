//! Process-wide registry of live jobs.
//!
//! The registry holds every job from successful submission until the monitor
//! observes its terminal state. It is the single mediator between the
//! manager (which publishes jobs and requests stops) and the monitors (which
//! drive status transitions); neither owns the other. The mutex guards only
//! map mutations and is never held across I/O — callers that need to iterate
//! take a [`JobRegistry::snapshot`].

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::errors::{JobError, Result};
use crate::models::{Backend, Job, JobStatus};

#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a job. Fails with `Duplicate` if the id is already present.
    pub fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        if jobs.contains_key(&job.job_id) {
            return Err(JobError::Duplicate(job.job_id));
        }
        jobs.insert(job.job_id, job);
        Ok(())
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.get(&job_id).cloned()
    }

    pub fn contains(&self, job_id: Uuid) -> bool {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.contains_key(&job_id)
    }

    /// Advance a job along the state machine. Rejects regressions and any
    /// transition out of a terminal state with `InvalidTransition`.
    pub fn update_status(&self, job_id: Uuid, new_status: JobStatus) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        if !job.status.can_transition_to(new_status) {
            return Err(JobError::InvalidTransition {
                from: job.status,
                to: new_status,
            });
        }
        job.status = new_status;
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Record the identifier the external system assigned. Set-once: a second
    /// call for the same job is rejected.
    pub fn set_backend_job_id(&self, job_id: Uuid, backend_job_id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        if job.backend_job_id.is_some() {
            return Err(JobError::Malformed(format!(
                "backend job id for {job_id} already set"
            )));
        }
        job.backend_job_id = Some(backend_job_id.to_string());
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn append_logs(&self, job_id: Uuid, chunk: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        job.logs.push_str(chunk);
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    /// Bump the infrastructure restart counter after a retried submission.
    pub fn record_restart(&self, job_id: Uuid) -> Result<()> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        let job = jobs.get_mut(&job_id).ok_or(JobError::NotFound(job_id))?;
        job.restart_count += 1;
        job.updated_at = chrono::Utc::now();
        Ok(())
    }

    pub fn remove(&self, job_id: Uuid) -> Option<Job> {
        let mut jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.remove(&job_id)
    }

    /// Deep copy of all entries. The list endpoint serializes from this copy
    /// so the lock is released before any serialization work happens.
    pub fn snapshot(&self) -> HashMap<Uuid, Job> {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.clone()
    }

    /// Jobs belonging to one backend, for the monitor sweep.
    pub fn snapshot_backend(&self, backend: Backend) -> Vec<Job> {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.values()
            .filter(|job| job.backend == backend)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let jobs = self.jobs.lock().expect("registry mutex poisoned");
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
