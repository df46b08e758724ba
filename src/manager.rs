//! Job manager façade: the single entry point the HTTP layer talks to.
//!
//! `execute` runs the ordered submission pipeline — validate, cache check,
//! persist a queued row, adapter submit with backoff, publish to the
//! registry — so that a crash between any two steps leaves no orphan: the
//! queued row exists before the (idempotent) submit, and the registry entry
//! is published last. `stop` is the symmetric teardown path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backends::{backoff_delay, ComputeBackend};
use crate::cache::JobCache;
use crate::config::ControllerConfig;
use crate::db::JobStore;
use crate::errors::{JobError, Result};
use crate::models::{Backend, Job, JobRequest, JobStatus, JobSummary};
use crate::registry::JobRegistry;

pub struct JobManager {
    config: ControllerConfig,
    registry: Arc<JobRegistry>,
    store: JobStore,
    cache: JobCache,
    backends: HashMap<Backend, Arc<dyn ComputeBackend>>,
}

impl JobManager {
    pub fn new(
        config: ControllerConfig,
        registry: Arc<JobRegistry>,
        store: JobStore,
        cache: JobCache,
        backends: HashMap<Backend, Arc<dyn ComputeBackend>>,
    ) -> Self {
        Self {
            config,
            registry,
            store,
            cache,
            backends,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn cache(&self) -> &JobCache {
        &self.cache
    }

    fn adapter(&self, backend: Backend) -> Result<Arc<dyn ComputeBackend>> {
        if !self.config.backend_enabled(backend) {
            return Err(JobError::Malformed(format!(
                "compute backend '{backend}' is not enabled"
            )));
        }
        self.backends
            .get(&backend)
            .cloned()
            .ok_or_else(|| JobError::Malformed(format!("no adapter for backend '{backend}'")))
    }

    /// Accept a job request and drive it to a submitted (or cached, or
    /// terminally failed) state. Returns the new job id.
    pub async fn execute(&self, request: JobRequest) -> Result<Uuid> {
        let adapter = self.adapter(request.compute_backend)?;

        let cache_spec = if self.cache.enabled() {
            Some(request.cache_spec()?)
        } else {
            None
        };
        let workflow_json = request.workflow_json.clone().unwrap_or(Value::Null);

        let mut job = request.into_job(&self.config)?;

        if let Some(spec) = &cache_spec {
            let fingerprint = self
                .cache
                .fingerprint_blocking(spec, &workflow_json, &job.workflow_workspace)
                .await?;
            if let Some(hit) = self.cache.lookup(&fingerprint).await? {
                return self.short_circuit_cached(job, hit).await;
            }
            job.cache_fingerprint = Some(fingerprint);
        }

        // A queued row lands before the submit: if we crash in between, the
        // idempotent submit plus this row are enough to reconcile.
        self.store.insert_job(&job).await?;

        match self.submit_with_retries(adapter.as_ref(), &mut job).await {
            Ok(backend_job_id) => {
                job.backend_job_id = Some(backend_job_id.clone());
                self.store
                    .set_backend_job_id(job.job_id, &backend_job_id)
                    .await?;
                let job_id = job.job_id;
                info!(%job_id, backend = %job.backend, %backend_job_id, "job submitted");
                self.registry.insert(job)?;
                Ok(job_id)
            }
            Err(err) => {
                // Permanent failure (or exhausted retries): the job exists
                // and is failed, which is the honest outcome for the caller.
                let job_id = job.job_id;
                let diagnostic = format!("[job-controller] submission failed: {err}");
                warn!(%job_id, backend = %job.backend, %err, "submission terminally failed");
                self.store
                    .update_status_and_logs(job_id, JobStatus::Failed, &diagnostic)
                    .await?;
                Ok(job_id)
            }
        }
    }

    async fn short_circuit_cached(&self, mut job: Job, hit: crate::cache::CacheHit) -> Result<Uuid> {
        self.cache.hydrate(&hit, &job.workflow_workspace).await?;
        job.status = JobStatus::Finished;
        job.cache_fingerprint = Some(hit.fingerprint.clone());
        self.store.insert_job(&job).await?;
        info!(
            job_id = %job.job_id,
            fingerprint = %hit.fingerprint,
            "cache hit, workspace hydrated without submission"
        );
        Ok(job.job_id)
    }

    /// Infrastructure-level submission retry: transient errors back off
    /// exponentially up to the job's restart budget, permanent errors fail
    /// fast.
    async fn submit_with_retries(
        &self,
        adapter: &dyn ComputeBackend,
        job: &mut Job,
    ) -> Result<String> {
        loop {
            match adapter.submit(job).await {
                Ok(backend_job_id) => return Ok(backend_job_id),
                Err(err) if err.is_transient() && job.restart_count < job.max_restart_count => {
                    let delay = backoff_delay(job.restart_count);
                    job.restart_count += 1;
                    warn!(
                        job_id = %job.job_id,
                        attempt = job.restart_count,
                        max = job.max_restart_count,
                        %err,
                        "transient submission failure, backing off {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Stop a job: adapter stop under a deadline, then mark it `stopped` in
    /// memory and write through to the database. Stopping an already
    /// terminal job is a no-op success.
    pub async fn stop(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.registry.get(job_id) else {
            return match self.store.fetch_job(job_id).await? {
                // Already terminalized and evicted from the registry.
                Some(_) => Ok(()),
                None => Err(JobError::NotFound(job_id)),
            };
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        let adapter = self.adapter(job.backend)?;
        let deadline = Duration::from_secs(self.config.stop_deadline_secs);
        match tokio::time::timeout(deadline, adapter.stop(&job)).await {
            Ok(result) => result.map_err(|e| match e {
                JobError::BackendStop(_) => e,
                other => JobError::BackendStop(other.to_string()),
            })?,
            Err(_) => {
                return Err(JobError::BackendStop(format!(
                    "stop did not complete within {}s",
                    self.config.stop_deadline_secs
                )))
            }
        }

        match self.registry.update_status(job_id, JobStatus::Stopped) {
            Ok(()) => {}
            // Raced with the monitor: the job just terminalized on its own.
            Err(JobError::NotFound(_)) | Err(JobError::InvalidTransition { .. }) => return Ok(()),
            Err(other) => return Err(other),
        }
        let logs = self
            .registry
            .get(job_id)
            .map(|j| j.logs)
            .unwrap_or_default();
        self.store
            .update_status_and_logs(job_id, JobStatus::Stopped, &logs)
            .await?;
        info!(%job_id, "job stopped");
        Ok(())
    }

    /// Job summary for the HTTP layer: live jobs come from the registry,
    /// terminalized ones from the database.
    pub async fn job_summary(&self, job_id: Uuid) -> Result<Option<JobSummary>> {
        if let Some(job) = self.registry.get(job_id) {
            return Ok(Some(JobSummary::from(&job)));
        }
        Ok(self.store.fetch_job(job_id).await?.map(|row| row.summary()))
    }

    /// Logs for the HTTP layer, with the same registry-then-database rule.
    pub async fn job_logs(&self, job_id: Uuid) -> Result<Option<String>> {
        if let Some(job) = self.registry.get(job_id) {
            return Ok(Some(job.logs));
        }
        Ok(self.store.fetch_job(job_id).await?.map(|row| row.logs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{StatusProbe, SubmittedJobs};
    use async_trait::async_trait;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Scripted in-memory backend: fails `failures` times with the given
    /// transience, then succeeds, counting every submit call.
    struct ScriptedBackend {
        submitted: SubmittedJobs,
        submit_calls: AtomicU32,
        stop_calls: AtomicU32,
        failures: AtomicU32,
        transient: bool,
    }

    impl ScriptedBackend {
        fn succeeding() -> Self {
            Self::failing(0, true)
        }

        fn failing(failures: u32, transient: bool) -> Self {
            Self {
                submitted: SubmittedJobs::default(),
                submit_calls: AtomicU32::new(0),
                stop_calls: AtomicU32::new(0),
                failures: AtomicU32::new(failures),
                transient,
            }
        }
    }

    #[async_trait]
    impl ComputeBackend for ScriptedBackend {
        fn kind(&self) -> Backend {
            Backend::Kubernetes
        }

        async fn submit(&self, job: &Job) -> Result<String> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(existing) = self.submitted.get(job.job_id) {
                return Ok(existing);
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
                .is_ok()
            {
                return if self.transient {
                    Err(JobError::BackendTransient("socket timeout".into()))
                } else {
                    Err(JobError::BackendPermanent("image not found".into()))
                };
            }
            let backend_job_id = format!("ext-{}", job.job_id);
            self.submitted.record(job.job_id, &backend_job_id);
            Ok(backend_job_id)
        }

        async fn stop(&self, _job: &Job) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn fetch_logs(&self, _job: &Job) -> Result<String> {
            Ok("hi\n".to_string())
        }

        async fn poll_status(&self, _backend_job_id: &str) -> Result<StatusProbe> {
            Ok(StatusProbe::running())
        }
    }

    struct Fixture {
        manager: JobManager,
        backend: Arc<ScriptedBackend>,
        workspace_root: TempDir,
    }

    async fn fixture(backend: ScriptedBackend, cache_enabled: bool) -> Fixture {
        let workspace_root = TempDir::new().unwrap();
        let mut config = ControllerConfig::default();
        config.workspace_root = workspace_root.path().to_path_buf();

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_schema().await.unwrap();

        let registry = Arc::new(JobRegistry::new());
        let cache = JobCache::new(store.clone(), cache_enabled);
        let backend = Arc::new(backend);
        let mut backends: HashMap<Backend, Arc<dyn ComputeBackend>> = HashMap::new();
        backends.insert(Backend::Kubernetes, backend.clone());

        Fixture {
            manager: JobManager::new(config, registry, store, cache, backends),
            backend,
            workspace_root,
        }
    }

    fn request(fixture: &Fixture) -> JobRequest {
        let workspace = fixture.workspace_root.path().join("w1");
        std::fs::create_dir_all(&workspace).unwrap();
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: workspace.to_string_lossy().into_owned(),
            cmd: "echo hi".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_execute_publishes_to_registry_and_db() {
        let f = fixture(ScriptedBackend::succeeding(), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();

        let job = f.manager.registry().get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.backend_job_id.as_deref(), Some(&*format!("ext-{job_id}")));

        let row = f.manager.store().fetch_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert_eq!(row.backend_job_id, job.backend_job_id);
        assert_eq!(f.backend.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_execute_rejects_disabled_backend() {
        let f = fixture(ScriptedBackend::succeeding(), false).await;
        let mut req = request(&f);
        req.compute_backend = Backend::HpcBatch;
        assert!(matches!(
            f.manager.execute(req).await,
            Err(JobError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_transient_submission_failures_are_retried() {
        let f = fixture(ScriptedBackend::failing(2, true), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();

        assert_eq!(f.backend.submit_calls.load(Ordering::SeqCst), 3);
        let job = f.manager.registry().get(job_id).unwrap();
        assert_eq!(job.restart_count, 2);
        assert!(job.backend_job_id.is_some());
    }

    #[tokio::test]
    async fn test_permanent_submission_failure_terminalizes() {
        let f = fixture(ScriptedBackend::failing(1, false), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();

        // Fail-fast: one call, no retry, no registry entry.
        assert_eq!(f.backend.submit_calls.load(Ordering::SeqCst), 1);
        assert!(!f.manager.registry().contains(job_id));

        let row = f.manager.store().fetch_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert!(row.logs.starts_with("[job-controller]"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_terminalize() {
        let f = fixture(ScriptedBackend::failing(10, true), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();

        // Initial attempt plus max_restart_count retries.
        assert_eq!(f.backend.submit_calls.load(Ordering::SeqCst), 4);
        let row = f.manager.store().fetch_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_cache_hit_short_circuits_submission() {
        let f = fixture(ScriptedBackend::succeeding(), true).await;
        let req = request(&f);
        let workspace = PathBuf::from(&req.workflow_workspace);
        std::fs::write(workspace.join("input.txt"), b"data").unwrap();

        // Prime the cache as the monitor would after a finished job.
        let spec = req.cache_spec().unwrap();
        let fp = f
            .manager
            .cache()
            .fingerprint_blocking(&spec, &Value::Null, &workspace)
            .await
            .unwrap();
        std::fs::write(workspace.join("output.txt"), b"result").unwrap();
        f.manager.cache().store_result(&workspace, &fp).await.unwrap();
        std::fs::remove_file(workspace.join("output.txt")).unwrap();

        let job_id = f.manager.execute(req).await.unwrap();

        // No adapter call happened and the workspace has the outputs back.
        assert_eq!(f.backend.submit_calls.load(Ordering::SeqCst), 0);
        assert!(workspace.join("output.txt").exists());
        assert!(!f.manager.registry().contains(job_id));
        let row = f.manager.store().fetch_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Finished);
        assert!(row.logs.is_empty());
    }

    #[tokio::test]
    async fn test_stop_running_job() {
        let f = fixture(ScriptedBackend::succeeding(), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();
        f.manager.registry().update_status(job_id, JobStatus::Running).unwrap();

        f.manager.stop(job_id).await.unwrap();
        assert_eq!(f.backend.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.manager.registry().get(job_id).unwrap().status,
            JobStatus::Stopped
        );
        let row = f.manager.store().fetch_job(job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_is_noop_for_terminal_and_errs_for_unknown() {
        let f = fixture(ScriptedBackend::succeeding(), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();
        f.manager.registry().update_status(job_id, JobStatus::Running).unwrap();
        f.manager.registry().update_status(job_id, JobStatus::Finished).unwrap();

        f.manager.stop(job_id).await.unwrap();
        assert_eq!(f.backend.stop_calls.load(Ordering::SeqCst), 0);

        assert!(matches!(
            f.manager.stop(Uuid::new_v4()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_summary_falls_back_to_database() {
        let f = fixture(ScriptedBackend::succeeding(), false).await;
        let job_id = f.manager.execute(request(&f)).await.unwrap();

        // Simulate the monitor terminalizing and evicting the job.
        f.manager.registry().update_status(job_id, JobStatus::Running).unwrap();
        f.manager.registry().update_status(job_id, JobStatus::Finished).unwrap();
        f.manager
            .store()
            .update_status_and_logs(job_id, JobStatus::Finished, "hi\n")
            .await
            .unwrap();
        f.manager.registry().remove(job_id);

        let summary = f.manager.job_summary(job_id).await.unwrap().unwrap();
        assert_eq!(summary.status, JobStatus::Finished);
        let logs = f.manager.job_logs(job_id).await.unwrap().unwrap();
        assert_eq!(logs, "hi\n");

        assert!(f
            .manager
            .job_summary(Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
