//! Compute backend adapters.
//!
//! One [`ComputeBackend`] contract, four implementations selected at submit
//! time by the job's `backend` field. Everything vendor-specific stays
//! behind the trait; the manager and monitors only ever see
//! `submit / stop / fetch_logs / poll_status`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::errors::{JobError, Result};
use crate::models::{Backend, Job};

pub mod hpc;
pub mod htcgrid;
pub mod kubernetes;
pub mod remote_htc;

/// Abstract phase a backend reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPhase {
    Running,
    Finished,
    Failed,
    Unknown,
}

/// One observation of a backend job's state.
#[derive(Debug, Clone)]
pub struct StatusProbe {
    pub phase: BackendPhase,
    pub exit_code: Option<i32>,
    /// Backend-supplied failure cause (out-of-memory kill, deadline
    /// exceeded, image pull failure, node loss).
    pub diagnostic: Option<String>,
}

impl StatusProbe {
    pub fn running() -> Self {
        Self {
            phase: BackendPhase::Running,
            exit_code: None,
            diagnostic: None,
        }
    }

    pub fn finished() -> Self {
        Self {
            phase: BackendPhase::Finished,
            exit_code: Some(0),
            diagnostic: None,
        }
    }

    pub fn failed(exit_code: Option<i32>, diagnostic: Option<String>) -> Self {
        Self {
            phase: BackendPhase::Failed,
            exit_code,
            diagnostic,
        }
    }

    pub fn unknown(diagnostic: Option<String>) -> Self {
        Self {
            phase: BackendPhase::Unknown,
            exit_code: None,
            diagnostic,
        }
    }
}

/// The polymorphic contract every compute backend implements.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    fn kind(&self) -> Backend;

    /// Submit the job and return the backend-assigned identifier.
    ///
    /// Idempotent across retries: a second call for the same `job_id`
    /// returns the existing identifier instead of creating a duplicate.
    async fn submit(&self, job: &Job) -> Result<String>;

    /// Best-effort stop. "Already terminated" and "never created" both count
    /// as success.
    async fn stop(&self, job: &Job) -> Result<()>;

    /// Final logs, or the best partial output the backend can provide.
    async fn fetch_logs(&self, job: &Job) -> Result<String>;

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe>;
}

/// Per-adapter record of submissions already acknowledged, keyed by job id.
/// This is what makes `submit` idempotent across manager retries.
#[derive(Debug, Default)]
pub struct SubmittedJobs {
    inner: Mutex<HashMap<Uuid, String>>,
}

impl SubmittedJobs {
    pub fn get(&self, job_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .expect("submitted-jobs mutex poisoned")
            .get(&job_id)
            .cloned()
    }

    pub fn record(&self, job_id: Uuid, backend_job_id: &str) {
        self.inner
            .lock()
            .expect("submitted-jobs mutex poisoned")
            .insert(job_id, backend_job_id.to_string());
    }

    pub fn forget(&self, job_id: Uuid) {
        self.inner
            .lock()
            .expect("submitted-jobs mutex poisoned")
            .remove(&job_id);
    }
}

/// Staging directory for a job's submission artifacts (wrapper script,
/// submit description, captured output). Lives inside the workspace so every
/// transport that can see the workspace can see it too.
pub fn staging_dir(job: &Job) -> PathBuf {
    job.workflow_workspace
        .join(".conductor")
        .join(job.job_id.to_string())
}

/// Shell snippet that transports the user command base64-encoded and expands
/// it on the far side. Survives any amount of shell quoting between here and
/// the execute node.
pub fn encoded_command(cmd: &str) -> String {
    format!("echo {} | base64 -d | bash", BASE64.encode(cmd))
}

/// The wrapper script shared by all backends: decode the command, run it,
/// capture the exit code and emit it to the staging directory.
pub fn wrapper_script(job: &Job) -> String {
    let encoded = BASE64.encode(&job.cmd);
    let exit_file = staging_dir(job).join("exit_code");
    format!(
        "#!/bin/bash\n\
         cmd=$(echo {encoded} | base64 -d)\n\
         eval \"$cmd\"\n\
         code=$?\n\
         echo \"$code\" > \"{exit}\"\n\
         exit \"$code\"\n",
        encoded = encoded,
        exit = exit_file.display(),
    )
}

/// Write the wrapper script into the staging directory and return its path.
pub fn write_wrapper_script(job: &Job) -> Result<PathBuf> {
    let dir = staging_dir(job);
    fs::create_dir_all(&dir)?;
    let path = dir.join("wrapper.sh");
    fs::write(&path, wrapper_script(job))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms)?;
    }
    Ok(path)
}

/// Read the exit code the wrapper emitted, if it got that far.
pub fn read_exit_code(job: &Job) -> Option<i32> {
    let path = staging_dir(job).join("exit_code");
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Render the files of a secrets directory into environment pairs: the file
/// name becomes the variable name, the trimmed content the value.
pub fn render_secrets(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut secrets = Vec::new();
    if !dir.is_dir() {
        return Ok(secrets);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let value = fs::read_to_string(entry.path())?;
        secrets.push((name, value.trim_end().to_string()));
    }
    secrets.sort();
    Ok(secrets)
}

/// Exponential backoff for transient submission failures: 1s, 2s, 4s, ...
/// capped at 30s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let secs = 1u64.checked_shl(attempt).unwrap_or(u64::MAX).min(30);
    Duration::from_secs(secs)
}

/// Map an HTTP transport failure onto the retry taxonomy: timeouts and
/// connection problems are transient, everything else is permanent.
pub fn classify_http_error(err: reqwest::Error) -> JobError {
    if err.is_timeout() || err.is_connect() {
        JobError::BackendTransient(err.to_string())
    } else {
        JobError::BackendPermanent(err.to_string())
    }
}

/// Map an HTTP response status onto the retry taxonomy: 5xx and 429 are
/// transient, other non-success codes are permanent.
pub fn classify_http_status(status: reqwest::StatusCode, body: &str) -> JobError {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        JobError::BackendTransient(format!("{status}: {body}"))
    } else {
        JobError::BackendPermanent(format!("{status}: {body}"))
    }
}

/// Build the adapter set for the enabled backends.
pub fn build_backends(config: &ControllerConfig) -> HashMap<Backend, Arc<dyn ComputeBackend>> {
    let mut backends: HashMap<Backend, Arc<dyn ComputeBackend>> = HashMap::new();
    for backend in &config.compute_backends {
        let adapter: Arc<dyn ComputeBackend> = match backend {
            Backend::Kubernetes => Arc::new(kubernetes::KubernetesBackend::new(
                config.kubernetes.clone(),
                config.secrets_dir.clone(),
            )),
            Backend::HtcGrid => Arc::new(htcgrid::HtcGridBackend::new(config.htcgrid.clone())),
            Backend::HpcBatch => Arc::new(hpc::HpcBatchBackend::new(config.hpc.clone())),
            Backend::RemoteHtc => {
                Arc::new(remote_htc::RemoteHtcBackend::new(config.remote_htc.clone()))
            }
        };
        backends.insert(*backend, adapter);
    }
    backends
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobRequest;
    use tempfile::TempDir;

    fn job_in(workspace: &Path) -> Job {
        let config = ControllerConfig {
            workspace_root: workspace.parent().unwrap().to_path_buf(),
            ..ControllerConfig::default()
        };
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: workspace.to_string_lossy().into_owned(),
            cmd: "echo 'it works' && exit 0".to_string(),
            ..Default::default()
        }
        .into_job(&config)
        .unwrap()
    }

    #[test]
    fn test_encoded_command_round_trips() {
        let snippet = encoded_command("echo \"hi there\" | wc -c");
        let encoded = snippet
            .strip_prefix("echo ")
            .unwrap()
            .split_whitespace()
            .next()
            .unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, b"echo \"hi there\" | wc -c");
        assert!(snippet.ends_with("| base64 -d | bash"));
    }

    #[test]
    fn test_wrapper_script_shape() {
        let ws = TempDir::new().unwrap();
        let workspace = ws.path().join("w1");
        fs::create_dir_all(&workspace).unwrap();
        let job = job_in(&workspace);

        let script = wrapper_script(&job);
        assert!(script.starts_with("#!/bin/bash\n"));
        // The raw command never appears; only its base64 form does.
        assert!(!script.contains("it works"));
        assert!(script.contains("base64 -d"));
        assert!(script.contains("exit_code"));
    }

    #[test]
    fn test_write_wrapper_and_read_exit_code() {
        let ws = TempDir::new().unwrap();
        let workspace = ws.path().join("w1");
        fs::create_dir_all(&workspace).unwrap();
        let job = job_in(&workspace);

        let path = write_wrapper_script(&job).unwrap();
        assert!(path.ends_with("wrapper.sh"));
        assert!(path.starts_with(staging_dir(&job)));

        assert_eq!(read_exit_code(&job), None);
        fs::write(staging_dir(&job).join("exit_code"), "2\n").unwrap();
        assert_eq!(read_exit_code(&job), Some(2));
    }

    #[test]
    fn test_submitted_jobs_idempotency_map() {
        let submitted = SubmittedJobs::default();
        let id = Uuid::new_v4();
        assert!(submitted.get(id).is_none());
        submitted.record(id, "cluster-42");
        assert_eq!(submitted.get(id).as_deref(), Some("cluster-42"));
        submitted.forget(id);
        assert!(submitted.get(id).is_none());
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_render_secrets() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("GRID_PASSPHRASE"), "s3cret\n").unwrap();
        fs::write(dir.path().join("TOKEN"), "abc").unwrap();
        let secrets = render_secrets(dir.path()).unwrap();
        assert_eq!(
            secrets,
            vec![
                ("GRID_PASSPHRASE".to_string(), "s3cret".to_string()),
                ("TOKEN".to_string(), "abc".to_string()),
            ]
        );
        // A missing directory renders no secrets.
        assert!(render_secrets(Path::new("/nonexistent")).unwrap().is_empty());
    }

    #[test]
    fn test_classify_http_status() {
        let transient = classify_http_status(reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(transient.is_transient());
        let permanent = classify_http_status(reqwest::StatusCode::UNPROCESSABLE_ENTITY, "bad image");
        assert!(!permanent.is_transient());
    }
}
