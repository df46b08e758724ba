//! Orderly shutdown of one controller instance.
//!
//! Triggered by the pre-stop endpoint or a termination signal: quiesce new
//! submissions, stop every live job with bounded concurrency, wait for the
//! monitors to observe the stops under a global deadline, then drain the
//! monitor tasks. Whatever the outcome, the process proceeds to exit;
//! failure only changes the report.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::manager::JobManager;
use crate::monitor::MonitorSet;

pub struct ShutdownCoordinator {
    accepting: AtomicBool,
    manager: Arc<JobManager>,
    monitors: Mutex<Option<MonitorSet>>,
    deadline: Duration,
    concurrency: usize,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<JobManager>, monitors: MonitorSet, deadline: Duration, concurrency: usize) -> Self {
        Self {
            accepting: AtomicBool::new(true),
            manager,
            monitors: Mutex::new(Some(monitors)),
            deadline,
            concurrency: concurrency.max(1),
        }
    }

    /// Whether `POST /jobs` is still accepted.
    pub fn accepting_submissions(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Refuse further submissions.
    pub fn quiesce(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Stop all live jobs and drain the monitors. On success the registry
    /// is empty; on failure the ids that did not terminalize in time are
    /// returned.
    pub async fn shutdown(&self) -> Result<(), Vec<Uuid>> {
        self.quiesce();
        let registry = self.manager.registry().clone();
        let job_ids: Vec<Uuid> = registry.snapshot().into_keys().collect();
        info!(jobs = job_ids.len(), "shutdown requested, stopping live jobs");

        stream::iter(job_ids)
            .map(|job_id| {
                let manager = self.manager.clone();
                async move {
                    if let Err(err) = manager.stop(job_id).await {
                        warn!(%job_id, %err, "could not stop job during shutdown");
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<()>>()
            .await;

        // Give the monitors one deadline to observe every stop and empty
        // the registry.
        let deadline = tokio::time::Instant::now() + self.deadline;
        while !registry.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        if let Some(monitors) = self.monitors.lock().await.take() {
            monitors.shutdown().await;
        }

        let remaining: Vec<Uuid> = registry.snapshot().into_keys().collect();
        if remaining.is_empty() {
            info!("all jobs terminalized, shutdown complete");
            Ok(())
        } else {
            warn!(?remaining, "jobs still live after shutdown deadline");
            Err(remaining)
        }
    }
}
