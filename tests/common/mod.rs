//! Shared fixtures for the integration tests: a scriptable in-memory
//! compute backend and a fully wired controller around it.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor::backends::{ComputeBackend, StatusProbe, SubmittedJobs};
use conductor::cache::JobCache;
use conductor::config::ControllerConfig;
use conductor::db::JobStore;
use conductor::errors::Result;
use conductor::manager::JobManager;
use conductor::models::{Backend, Job, JobRequest};
use conductor::monitor::MonitorSet;
use conductor::registry::JobRegistry;
use conductor::server::{router, AppState};
use conductor::shutdown::ShutdownCoordinator;
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

/// Backend that walks each job through a scripted sequence of probes.
/// The last probe in the plan repeats forever.
pub struct MockBackend {
    plan: Vec<StatusProbe>,
    remaining: Mutex<HashMap<String, VecDeque<StatusProbe>>>,
    logs: Mutex<String>,
    submitted: SubmittedJobs,
    pub submit_calls: AtomicU32,
    pub stop_calls: AtomicU32,
}

impl MockBackend {
    pub fn with_plan(plan: Vec<StatusProbe>) -> Self {
        Self {
            plan,
            remaining: Mutex::new(HashMap::new()),
            logs: Mutex::new("hi\n".to_string()),
            submitted: SubmittedJobs::default(),
            submit_calls: AtomicU32::new(0),
            stop_calls: AtomicU32::new(0),
        }
    }

    pub fn set_logs(&self, logs: &str) {
        *self.logs.lock().unwrap() = logs.to_string();
    }
}

#[async_trait]
impl ComputeBackend for MockBackend {
    fn kind(&self) -> Backend {
        Backend::Kubernetes
    }

    async fn submit(&self, job: &Job) -> Result<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(existing) = self.submitted.get(job.job_id) {
            return Ok(existing);
        }
        let backend_job_id = format!("mock-{}", job.job_id);
        self.remaining
            .lock()
            .unwrap()
            .insert(backend_job_id.clone(), self.plan.iter().cloned().collect());
        self.submitted.record(job.job_id, &backend_job_id);
        Ok(backend_job_id)
    }

    async fn stop(&self, _job: &Job) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_logs(&self, _job: &Job) -> Result<String> {
        Ok(self.logs.lock().unwrap().clone())
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe> {
        let mut remaining = self.remaining.lock().unwrap();
        let Some(plan) = remaining.get_mut(backend_job_id) else {
            return Ok(StatusProbe::unknown(None));
        };
        if plan.len() > 1 {
            Ok(plan.pop_front().expect("plan is non-empty"))
        } else {
            Ok(plan
                .front()
                .cloned()
                .unwrap_or_else(|| StatusProbe::unknown(None)))
        }
    }
}

/// A controller wired end to end against a [`MockBackend`], with monitors
/// polling as fast as the runtime allows.
pub struct TestController {
    pub app: axum::Router,
    pub manager: Arc<JobManager>,
    pub registry: Arc<JobRegistry>,
    pub store: JobStore,
    pub coordinator: Arc<ShutdownCoordinator>,
    pub backend: Arc<MockBackend>,
    pub workspace_root: TempDir,
}

impl TestController {
    pub async fn start(backend: MockBackend, cache_enabled: bool) -> Self {
        let workspace_root = TempDir::new().unwrap();
        let mut config = ControllerConfig::default();
        config.workspace_root = workspace_root.path().to_path_buf();
        config.poll_interval_secs = 0;
        config.poll_jitter_secs = 0;
        config.shutdown_deadline_secs = 5;

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

        let manager = Arc::new(JobManager::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            cache.clone(),
            backends.clone(),
        ));
        let monitors = MonitorSet::spawn(&config, registry.clone(), store.clone(), cache, &backends);
        let coordinator = Arc::new(ShutdownCoordinator::new(
            manager.clone(),
            monitors,
            Duration::from_secs(config.shutdown_deadline_secs),
            config.shutdown_concurrency,
        ));

        let state = Arc::new(AppState {
            manager: manager.clone(),
            coordinator: coordinator.clone(),
        });
        Self {
            app: router(state),
            manager,
            registry,
            store,
            coordinator,
            backend,
            workspace_root,
        }
    }

    pub fn workspace(&self, name: &str) -> PathBuf {
        let path = self.workspace_root.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }

    pub fn request(&self, name: &str) -> JobRequest {
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: name.to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: self.workspace("w1").to_string_lossy().into_owned(),
            cmd: "echo hi".to_string(),
            ..Default::default()
        }
    }
}

/// Poll until `predicate` holds, failing the test after five seconds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !predicate() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within deadline"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
