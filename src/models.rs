//! Core data model: jobs, statuses, backends and the HTTP request/response
//! shapes.
//!
//! `JobRequest` is the wire format accepted by `POST /jobs`. It is parsed
//! once at the HTTP boundary into a [`Job`], which carries a typed
//! [`BackendParams`] variant instead of the request's flat per-backend
//! fields. Everything past the boundary works with `Job` only.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::errors::JobError;

/// Compute backend a job is dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "kubernetes")]
    Kubernetes,
    #[serde(rename = "htc-grid")]
    HtcGrid,
    #[serde(rename = "hpc-batch")]
    HpcBatch,
    #[serde(rename = "remote-htc")]
    RemoteHtc,
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Kubernetes
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::Kubernetes => "kubernetes",
            Backend::HtcGrid => "htc-grid",
            Backend::HpcBatch => "hpc-batch",
            Backend::RemoteHtc => "remote-htc",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kubernetes" => Ok(Backend::Kubernetes),
            "htc-grid" => Ok(Backend::HtcGrid),
            "hpc-batch" => Ok(Backend::HpcBatch),
            "remote-htc" => Ok(Backend::RemoteHtc),
            other => Err(JobError::Malformed(format!(
                "unknown compute backend '{other}'"
            ))),
        }
    }
}

/// Lifecycle state of a job.
///
/// Statuses are monotonic along `queued -> running -> terminal`; a queued job
/// may also jump straight to `failed` (submission failed) or `stopped`
/// (cancelled before it ran). No transition ever leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Finished,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (a, b) if a == b => true,
            (JobStatus::Queued, JobStatus::Running)
            | (JobStatus::Queued, JobStatus::Finished)
            | (JobStatus::Queued, JobStatus::Failed)
            | (JobStatus::Queued, JobStatus::Stopped)
            | (JobStatus::Running, JobStatus::Finished)
            | (JobStatus::Running, JobStatus::Failed)
            | (JobStatus::Running, JobStatus::Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(JobError::Malformed(format!("unknown job status '{other}'"))),
        }
    }
}

/// Kubernetes-specific submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesParams {
    pub uid: Option<i64>,
    pub memory_limit: Option<String>,
    /// Active-deadline timeout in seconds.
    pub job_timeout: Option<u64>,
}

/// HTC-grid submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HtcGridParams {
    pub accounting_group: Option<String>,
    pub max_runtime: Option<String>,
    /// Extract the image from the CVMFS unpacked area instead of pulling.
    pub unpacked_img: bool,
}

/// HPC batch (Slurm) submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HpcBatchParams {
    pub partition: Option<String>,
    pub time: Option<String>,
}

/// Remote-HTC gateway submission parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteHtcParams {
    pub cpu_cores: Option<u32>,
    pub memory_limit: Option<String>,
    pub additional_requirements: Option<String>,
}

/// Per-backend parameter bag, tagged by the backend the job targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendParams {
    Kubernetes(KubernetesParams),
    HtcGrid(HtcGridParams),
    HpcBatch(HpcBatchParams),
    RemoteHtc(RemoteHtcParams),
}

/// Credential integrations requested for the job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFlags {
    pub kerberos: bool,
    pub voms_proxy: bool,
    pub rucio: bool,
}

/// A job tracked by the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: Uuid,
    pub backend: Backend,
    /// Identifier assigned by the external compute system. `None` only while
    /// the job is still queued; once set it is never overwritten.
    pub backend_job_id: Option<String>,
    pub job_name: String,
    pub workflow_uuid: String,
    pub workflow_workspace: PathBuf,
    pub docker_img: String,
    pub cmd: String,
    pub prettified_cmd: Option<String>,
    pub env_vars: HashMap<String, String>,
    pub cvmfs_mounts: Vec<String>,
    pub shared_file_system: bool,
    pub status: JobStatus,
    pub logs: String,
    pub backend_params: BackendParams,
    pub credentials: CredentialFlags,
    /// Cache key computed at submission time; the monitor archives the
    /// workspace under it when the job finishes.
    pub cache_fingerprint: Option<String>,
    pub restart_count: u32,
    pub max_restart_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The job shape served by the list/get endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub cmd: String,
    pub cvmfs_mounts: Vec<String>,
    pub docker_img: String,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub restart_count: u32,
    pub max_restart_count: u32,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        JobSummary {
            cmd: job.cmd.clone(),
            cvmfs_mounts: job.cvmfs_mounts.clone(),
            docker_img: job.docker_img.clone(),
            job_id: job.job_id,
            status: job.status,
            restart_count: job.restart_count,
            max_restart_count: job.max_restart_count,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Wire format of `POST /jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobRequest {
    pub docker_img: String,
    pub job_name: String,
    pub workflow_uuid: String,
    pub workflow_workspace: String,
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub compute_backend: Backend,
    /// Comma-separated CVMFS repository list.
    pub cvmfs_mounts: Option<String>,
    #[serde(default = "default_true")]
    pub shared_file_system: bool,
    pub prettified_cmd: Option<String>,
    #[serde(default)]
    pub unpacked_img: bool,
    #[serde(default)]
    pub kerberos: bool,
    #[serde(default)]
    pub voms_proxy: bool,
    #[serde(default)]
    pub rucio: bool,
    /// Workflow description used for cache fingerprinting.
    pub workflow_json: Option<serde_json::Value>,

    pub kubernetes_uid: Option<i64>,
    pub kubernetes_memory_limit: Option<String>,
    pub kubernetes_job_timeout: Option<u64>,
    pub htcondor_accounting_group: Option<String>,
    pub htcondor_max_runtime: Option<String>,
    pub slurm_partition: Option<String>,
    pub slurm_time: Option<String>,
    pub c4p_cpu_cores: Option<u32>,
    pub c4p_memory_limit: Option<String>,
    pub c4p_additional_requirements: Option<String>,
}

/// Kubernetes memory quantities: a positive integer with an optional
/// binary/decimal suffix, e.g. `4Gi`, `512Mi`, `2G`.
pub fn validate_memory_limit(quantity: &str) -> Result<(), JobError> {
    let valid_suffix = ["Ki", "Mi", "Gi", "Ti", "K", "M", "G", "T", "E", "P"];
    let digits: String = quantity.chars().take_while(|c| c.is_ascii_digit()).collect();
    let suffix = &quantity[digits.len()..];
    if digits.is_empty() || !(suffix.is_empty() || valid_suffix.contains(&suffix)) {
        return Err(JobError::Malformed(format!(
            "kubernetes memory limit '{quantity}' has wrong format"
        )));
    }
    Ok(())
}

/// Light image-reference validation: registry/repository[:tag][@digest]
/// characters only, no whitespace or shell metacharacters.
pub fn validate_image_reference(image: &str) -> Result<(), JobError> {
    let valid = !image.is_empty()
        && image.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
        });
    if !valid {
        return Err(JobError::Malformed(format!(
            "container image reference '{image}' is not valid"
        )));
    }
    Ok(())
}

/// Reject workspaces that escape the configured shared-volume root.
pub fn validate_workspace(root: &Path, workspace: &Path) -> Result<(), JobError> {
    let mut normalized = PathBuf::new();
    for component in workspace.components() {
        use std::path::Component;
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(JobError::Malformed(format!(
                        "workspace '{}' escapes the workspace root",
                        workspace.display()
                    )));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if !normalized.starts_with(root) {
        return Err(JobError::Malformed(format!(
            "workspace '{}' is outside the workspace root '{}'",
            workspace.display(),
            root.display()
        )));
    }
    Ok(())
}

impl JobRequest {
    /// Collect the typed parameter bag for the backend this request targets.
    fn backend_params(&self) -> Result<BackendParams, JobError> {
        let params = match self.compute_backend {
            Backend::Kubernetes => {
                if let Some(limit) = &self.kubernetes_memory_limit {
                    validate_memory_limit(limit)?;
                }
                BackendParams::Kubernetes(KubernetesParams {
                    uid: self.kubernetes_uid,
                    memory_limit: self.kubernetes_memory_limit.clone(),
                    job_timeout: self.kubernetes_job_timeout,
                })
            }
            Backend::HtcGrid => BackendParams::HtcGrid(HtcGridParams {
                accounting_group: self.htcondor_accounting_group.clone(),
                max_runtime: self.htcondor_max_runtime.clone(),
                unpacked_img: self.unpacked_img,
            }),
            Backend::HpcBatch => BackendParams::HpcBatch(HpcBatchParams {
                partition: self.slurm_partition.clone(),
                time: self.slurm_time.clone(),
            }),
            Backend::RemoteHtc => BackendParams::RemoteHtc(RemoteHtcParams {
                cpu_cores: self.c4p_cpu_cores,
                memory_limit: self.c4p_memory_limit.clone(),
                additional_requirements: self.c4p_additional_requirements.clone(),
            }),
        };
        Ok(params)
    }

    /// Validate the request and build the job entity, assigning a fresh id.
    pub fn into_job(self, config: &ControllerConfig) -> Result<Job, JobError> {
        validate_image_reference(&self.docker_img)?;
        if self.job_name.trim().is_empty() {
            return Err(JobError::Malformed("job_name must not be empty".into()));
        }
        let workspace = PathBuf::from(&self.workflow_workspace);
        validate_workspace(&config.workspace_root, &workspace)?;

        let backend_params = self.backend_params()?;
        let cvmfs_mounts = self
            .cvmfs_mounts
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let now = Utc::now();
        Ok(Job {
            job_id: Uuid::new_v4(),
            backend: self.compute_backend,
            backend_job_id: None,
            job_name: self.job_name,
            workflow_uuid: self.workflow_uuid,
            workflow_workspace: workspace,
            docker_img: self.docker_img,
            cmd: self.cmd,
            prettified_cmd: self.prettified_cmd,
            env_vars: self.env_vars,
            cvmfs_mounts,
            shared_file_system: self.shared_file_system,
            status: JobStatus::Queued,
            logs: String::new(),
            backend_params,
            credentials: CredentialFlags {
                kerberos: self.kerberos,
                voms_proxy: self.voms_proxy,
                rucio: self.rucio,
            },
            cache_fingerprint: None,
            restart_count: 0,
            max_restart_count: config.max_restart_count,
            created_at: now,
            updated_at: now,
        })
    }

    /// The canonical JSON value fingerprinted by the job cache. `job_id` is
    /// never part of a request, so the spec hashed here is already id-free.
    pub fn cache_spec(&self) -> Result<serde_json::Value, JobError> {
        let params = self.backend_params()?;
        Ok(serde_json::json!({
            "cmd": self.cmd,
            "docker_img": self.docker_img,
            "env_vars": self.env_vars,
            "compute_backend_params": params,
        }))
    }
}
