//! Controller configuration.
//!
//! Defaults are overridable from the environment; the server binary merges
//! CLI flags on top. Only the backends named in `COMPUTE_BACKENDS` get an
//! adapter and a monitor.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::JobError;
use crate::models::Backend;

/// Top-level configuration for one controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Hostname or IP address to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Database connection string
    pub database_uri: String,

    /// Root of the shared filesystem that all workflow workspaces live under
    pub workspace_root: PathBuf,

    /// Backends that accept submissions; one monitor is started per entry
    pub compute_backends: Vec<Backend>,

    /// Infrastructure-level submission retries before a job is failed
    pub max_restart_count: u32,

    /// Whether the job cache is consulted and populated
    pub cache_enabled: bool,

    /// Directory whose files are rendered into job environments as secrets
    pub secrets_dir: Option<PathBuf>,

    /// Process secret key for session/API signing
    pub secret_key: String,

    /// Monitor poll interval in seconds (jittered)
    pub poll_interval_secs: u64,

    /// Upper bound of the random jitter added to each poll interval
    pub poll_jitter_secs: u64,

    /// Timeout for any single per-job monitor operation; timeouts requeue
    pub per_job_timeout_secs: u64,

    /// Consecutive failed-container observations before a queued job is
    /// declared failed
    pub stall_threshold: u32,

    /// Deadline for one adapter stop call
    pub stop_deadline_secs: u64,

    /// Global deadline for terminalizing all jobs during shutdown
    pub shutdown_deadline_secs: u64,

    /// Bounded concurrency for stopping jobs during shutdown
    pub shutdown_concurrency: usize,

    pub kubernetes: KubernetesConfig,
    pub htcgrid: HtcGridConfig,
    pub hpc: HpcConfig,
    pub remote_htc: RemoteHtcConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            database_uri: "sqlite:jobs.db".to_string(),
            workspace_root: PathBuf::from("/workflows"),
            compute_backends: vec![Backend::Kubernetes],
            max_restart_count: 3,
            cache_enabled: true,
            secrets_dir: None,
            secret_key: "change-me".to_string(),
            poll_interval_secs: 15,
            poll_jitter_secs: 5,
            per_job_timeout_secs: 10,
            stall_threshold: 3,
            stop_deadline_secs: 10,
            shutdown_deadline_secs: 30,
            shutdown_concurrency: 32,
            kubernetes: KubernetesConfig::default(),
            htcgrid: HtcGridConfig::default(),
            hpc: HpcConfig::default(),
            remote_htc: RemoteHtcConfig::default(),
        }
    }
}

/// Kubernetes adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    /// Base URL of the API server
    pub api_url: String,

    /// Namespace job objects are created in
    pub namespace: String,

    /// Default memory limit applied when a request does not set one
    pub jobs_memory_limit: Option<String>,

    /// Secret attached as imagePullSecret when the image matches a private
    /// registry prefix
    pub image_pull_secret: Option<String>,

    /// Registry prefixes that require the image pull secret
    pub private_registries: Vec<String>,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_url: "https://kubernetes.default.svc".to_string(),
            namespace: "default".to_string(),
            jobs_memory_limit: None,
            image_pull_secret: None,
            private_registries: Vec::new(),
        }
    }
}

/// HTC-grid adapter settings. The executables are overridable so tests can
/// point them at fakes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HtcGridConfig {
    pub submit_exec: String,
    pub query_exec: String,
    pub history_exec: String,
    pub remove_exec: String,

    /// Scratch directory the wrapper restores the workspace into
    pub scratch_dir: PathBuf,

    /// CVMFS unpacked-image area used when `unpacked_img` is requested
    pub unpacked_img_root: String,
}

impl Default for HtcGridConfig {
    fn default() -> Self {
        Self {
            submit_exec: "condor_submit".to_string(),
            query_exec: "condor_q".to_string(),
            history_exec: "condor_history".to_string(),
            remove_exec: "condor_rm".to_string(),
            scratch_dir: PathBuf::from("/tmp"),
            unpacked_img_root: "/cvmfs/unpacked.cern.ch".to_string(),
        }
    }
}

/// HPC batch adapter settings: everything runs over SSH on the head node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HpcConfig {
    pub head_node: String,
    pub ssh_port: u16,
    pub ssh_user: Option<String>,
    pub ssh_exec: String,
    pub scp_exec: String,
    pub sbatch_exec: String,
    pub squeue_exec: String,
    pub sacct_exec: String,
    pub scancel_exec: String,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            head_node: "hpc-batch.default.svc".to_string(),
            ssh_port: 22,
            ssh_user: None,
            ssh_exec: "ssh".to_string(),
            scp_exec: "scp".to_string(),
            sbatch_exec: "sbatch".to_string(),
            squeue_exec: "squeue".to_string(),
            sacct_exec: "sacct".to_string(),
            scancel_exec: "scancel".to_string(),
        }
    }
}

/// Remote-HTC gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteHtcConfig {
    pub gateway_url: String,

    /// Issuer queried for a machine token before each expiring request
    pub token_issuer_url: String,

    /// Static token override; skips the issuer when set
    pub token: Option<String>,
}

impl Default for RemoteHtcConfig {
    fn default() -> Self {
        Self {
            gateway_url: "https://c4p-gateway.example.org".to_string(),
            token_issuer_url: "https://token-issuer.example.org".to_string(),
            token: None,
        }
    }
}

/// Parse a `COMPUTE_BACKENDS`-style comma-separated backend list.
pub fn parse_backend_list(raw: &str) -> Result<Vec<Backend>, JobError> {
    let mut backends = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend = Backend::from_str(name)?;
        if !backends.contains(&backend) {
            backends.push(backend);
        }
    }
    if backends.is_empty() {
        return Err(JobError::Malformed(
            "COMPUTE_BACKENDS does not name any backend".to_string(),
        ));
    }
    Ok(backends)
}

impl ControllerConfig {
    /// Build the configuration from the environment, starting from defaults.
    pub fn from_env() -> Result<Self, JobError> {
        let mut config = Self::default();
        if let Ok(uri) = env::var("REANA_SQLALCHEMY_DATABASE_URI") {
            config.database_uri = uri;
        }
        if let Ok(raw) = env::var("COMPUTE_BACKENDS") {
            config.compute_backends = parse_backend_list(&raw)?;
        }
        if let Ok(root) = env::var("SHARED_VOLUME_PATH_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Ok(limit) = env::var("REANA_KUBERNETES_JOBS_MEMORY_LIMIT") {
            config.kubernetes.jobs_memory_limit = Some(limit);
        }
        if let Ok(namespace) = env::var("REANA_RUNTIME_KUBERNETES_NAMESPACE") {
            config.kubernetes.namespace = namespace;
        }
        if let Ok(dir) = env::var("SECRETS_DIR") {
            config.secrets_dir = Some(PathBuf::from(dir));
        }
        if let Ok(key) = env::var("SECRET_KEY") {
            config.secret_key = key;
        }
        if let Ok(raw) = env::var("JOB_CACHE_ENABLED") {
            config.cache_enabled = raw == "1" || raw.eq_ignore_ascii_case("true");
        }
        Ok(config)
    }

    pub fn backend_enabled(&self, backend: Backend) -> bool {
        self.compute_backends.contains(&backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 5000);
        assert_eq!(config.compute_backends, vec![Backend::Kubernetes]);
        assert_eq!(config.max_restart_count, 3);
        assert!(config.cache_enabled);
        assert_eq!(config.poll_interval_secs, 15);
        assert_eq!(config.stall_threshold, 3);
        assert_eq!(config.shutdown_deadline_secs, 30);
        assert_eq!(config.shutdown_concurrency, 32);
        assert_eq!(config.kubernetes.namespace, "default");
    }

    #[test]
    fn test_parse_backend_list() {
        assert_eq!(
            parse_backend_list("kubernetes,htc-grid").unwrap(),
            vec![Backend::Kubernetes, Backend::HtcGrid]
        );
        assert_eq!(
            parse_backend_list(" hpc-batch , remote-htc ").unwrap(),
            vec![Backend::HpcBatch, Backend::RemoteHtc]
        );
        // Duplicates collapse, order is preserved.
        assert_eq!(
            parse_backend_list("kubernetes,kubernetes").unwrap(),
            vec![Backend::Kubernetes]
        );
        assert!(parse_backend_list("").is_err());
        assert!(parse_backend_list("mesos").is_err());
    }

    #[test]
    fn test_backend_enabled() {
        let mut config = ControllerConfig::default();
        config.compute_backends = vec![Backend::Kubernetes, Backend::HpcBatch];
        assert!(config.backend_enabled(Backend::Kubernetes));
        assert!(config.backend_enabled(Backend::HpcBatch));
        assert!(!config.backend_enabled(Backend::HtcGrid));
    }
}
