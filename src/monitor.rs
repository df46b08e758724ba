//! Per-backend monitoring loops.
//!
//! One monitor task runs per enabled backend. Each sweep snapshots the
//! registry, polls the backend for every live job and applies the observed
//! change: map the backend-native phase to the shared state machine, fetch
//! final logs on terminal transitions, write through to the database, and
//! evict terminalized jobs from the registry. Per-job operations are
//! bounded by a timeout; a timeout requeues the job for the next sweep, it
//! never terminalizes anything.
//!
//! The `MonitorSet` is constructed explicitly by the server entrypoint and
//! torn down on shutdown; there is no ambient global monitor state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backends::{BackendPhase, ComputeBackend, StatusProbe};
use crate::cache::JobCache;
use crate::config::ControllerConfig;
use crate::db::JobStore;
use crate::errors::JobError;
use crate::models::{Backend, Job, JobStatus};
use crate::registry::JobRegistry;

/// The monitor tasks for all enabled backends, plus their shared
/// termination token.
pub struct MonitorSet {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl MonitorSet {
    /// Spawn one monitor task per enabled backend.
    pub fn spawn(
        config: &ControllerConfig,
        registry: Arc<JobRegistry>,
        store: JobStore,
        cache: JobCache,
        backends: &HashMap<Backend, Arc<dyn ComputeBackend>>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for adapter in backends.values() {
            let monitor = Monitor::new(
                config,
                adapter.clone(),
                registry.clone(),
                store.clone(),
                cache.clone(),
            );
            handles.push(tokio::spawn(monitor.run(cancel.child_token())));
        }
        Self { cancel, handles }
    }

    /// Signal all monitors to exit their loops and wait for them.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Monitor {
    adapter: Arc<dyn ComputeBackend>,
    registry: Arc<JobRegistry>,
    store: JobStore,
    cache: JobCache,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    per_job_timeout: Duration,
    stall_threshold: u32,
    /// Consecutive failed-container observations per queued job.
    stall_counts: HashMap<Uuid, u32>,
}

impl Monitor {
    fn new(
        config: &ControllerConfig,
        adapter: Arc<dyn ComputeBackend>,
        registry: Arc<JobRegistry>,
        store: JobStore,
        cache: JobCache,
    ) -> Self {
        Self {
            adapter,
            registry,
            store,
            cache,
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            poll_jitter_secs: config.poll_jitter_secs,
            per_job_timeout: Duration::from_secs(config.per_job_timeout_secs),
            stall_threshold: config.stall_threshold,
            stall_counts: HashMap::new(),
        }
    }

    fn jittered_interval(&self) -> Duration {
        let jitter = if self.poll_jitter_secs == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.poll_jitter_secs)
        };
        self.poll_interval + Duration::from_secs(jitter)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let backend = self.adapter.kind();
        info!(%backend, "monitor started");
        loop {
            let interval = self.jittered_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.sweep().await;
        }
        info!(%backend, "monitor stopped");
    }

    /// One pass over this backend's live jobs.
    async fn sweep(&mut self) {
        let backend = self.adapter.kind();
        for job in self.registry.snapshot_backend(backend) {
            if job.status.is_terminal() {
                // Terminal state observed (a stop, or our own earlier
                // transition): the registry entry has served its purpose.
                self.registry.remove(job.job_id);
                self.stall_counts.remove(&job.job_id);
                continue;
            }
            let Some(backend_job_id) = job.backend_job_id.clone() else {
                // Submission still in flight on the manager side.
                continue;
            };
            let probe = match timeout(
                self.per_job_timeout,
                self.adapter.poll_status(&backend_job_id),
            )
            .await
            {
                Ok(Ok(probe)) => probe,
                Ok(Err(err)) => {
                    warn!(job_id = %job.job_id, %err, "status poll failed, requeueing");
                    continue;
                }
                Err(_) => {
                    warn!(job_id = %job.job_id, "status poll timed out, requeueing");
                    continue;
                }
            };
            self.apply(job, probe).await;
        }
    }

    async fn apply(&mut self, job: Job, probe: StatusProbe) {
        match probe.phase {
            BackendPhase::Running => {
                self.stall_counts.remove(&job.job_id);
                if job.status == JobStatus::Queued {
                    if let Err(err) = self.registry.update_status(job.job_id, JobStatus::Running)
                    {
                        debug!(job_id = %job.job_id, %err, "running transition rejected");
                        return;
                    }
                    if let Err(err) = self
                        .store
                        .update_status(job.job_id, JobStatus::Running)
                        .await
                    {
                        warn!(job_id = %job.job_id, %err, "could not persist running status");
                    }
                }
            }
            BackendPhase::Finished | BackendPhase::Failed => {
                self.terminalize(job, probe).await;
            }
            BackendPhase::Unknown => {
                let Some(diagnostic) = probe.diagnostic else {
                    self.stall_counts.remove(&job.job_id);
                    return;
                };
                if job.status != JobStatus::Queued {
                    return;
                }
                let count = self.stall_counts.entry(job.job_id).or_insert(0);
                *count += 1;
                warn!(
                    job_id = %job.job_id,
                    %diagnostic,
                    observations = *count,
                    "job is not starting"
                );
                if *count >= self.stall_threshold {
                    let probe = StatusProbe::failed(None, Some(diagnostic));
                    self.terminalize(job, probe).await;
                }
            }
        }
    }

    /// Drive a job into its terminal state: harvest logs, update registry
    /// and database, archive cacheable outputs, evict from the registry.
    async fn terminalize(&mut self, job: Job, probe: StatusProbe) {
        let status = match probe.phase {
            BackendPhase::Finished => JobStatus::Finished,
            _ => JobStatus::Failed,
        };

        let mut logs = match timeout(self.per_job_timeout, self.adapter.fetch_logs(&job)).await {
            Ok(Ok(logs)) => logs,
            Ok(Err(err)) => {
                warn!(job_id = %job.job_id, %err, "could not fetch final logs");
                String::new()
            }
            Err(_) => {
                warn!(job_id = %job.job_id, "log fetch timed out, keeping partial logs");
                String::new()
            }
        };
        // Some backends lose the exit code (held or removed grid jobs); the
        // wrapper's emitted file is the fallback channel.
        let exit_code = probe
            .exit_code
            .or_else(|| crate::backends::read_exit_code(&job));
        if let Some(code) = exit_code {
            if code != 0 {
                logs.push_str(&format!(
                    "\n[job-controller] command exited with status {code}\n"
                ));
            }
        }
        if let Some(diagnostic) = &probe.diagnostic {
            logs.push_str(&format!("\n[job-controller] job failed: {diagnostic}\n"));
        }

        match self.registry.update_status(job.job_id, status) {
            Ok(()) => {}
            Err(JobError::InvalidTransition { from, to }) => {
                // Raced with a stop; the stop's terminal state wins.
                debug!(job_id = %job.job_id, %from, %to, "terminal transition lost a race");
                self.registry.remove(job.job_id);
                self.stall_counts.remove(&job.job_id);
                return;
            }
            Err(err) => {
                debug!(job_id = %job.job_id, %err, "job vanished before terminalization");
                return;
            }
        }
        let _ = self.registry.append_logs(job.job_id, &logs);
        let full_logs = self
            .registry
            .get(job.job_id)
            .map(|j| j.logs)
            .unwrap_or(logs);

        if let Err(err) = self
            .store
            .update_status_and_logs(job.job_id, status, &full_logs)
            .await
        {
            warn!(job_id = %job.job_id, %err, "could not persist terminal status");
        }

        if status == JobStatus::Finished {
            if let Some(fingerprint) = &job.cache_fingerprint {
                if let Err(err) = self
                    .cache
                    .store_result(&job.workflow_workspace, fingerprint)
                    .await
                {
                    warn!(job_id = %job.job_id, %err, "could not archive job outputs");
                }
            }
        }

        self.registry.remove(job.job_id);
        self.stall_counts.remove(&job.job_id);
        info!(job_id = %job.job_id, %status, "job terminalized");
    }
}
