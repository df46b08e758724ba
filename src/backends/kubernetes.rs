//! Kubernetes adapter: one batch Job object per controller job.
//!
//! The job object carries a single primary container plus optional init
//! containers for credential refresh (Kerberos) and token-proxy (VOMS)
//! duties, the workspace as a shared volume, CVMFS repositories read-only
//! and the secrets volume. Execution is non-root with an optional memory
//! limit and active-deadline timeout.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::KubernetesConfig;
use crate::errors::{JobError, Result};
use crate::models::{Backend, BackendParams, Job};

use super::{
    classify_http_error, classify_http_status, encoded_command, render_secrets, ComputeBackend,
    StatusProbe, SubmittedJobs,
};

/// Default UID for job containers; request UIDs below 100 are refused.
const DEFAULT_RUNTIME_UID: i64 = 1000;
const MIN_RUNTIME_UID: i64 = 100;

const KRB5_SIDECAR_IMAGE: &str = "quay.io/conductor/krb5-renew:latest";
const VOMS_SIDECAR_IMAGE: &str = "quay.io/conductor/voms-proxy:latest";

/// In-cluster service account token, when running inside the cluster.
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

pub struct KubernetesBackend {
    client: reqwest::Client,
    config: KubernetesConfig,
    secrets_dir: Option<PathBuf>,
    bearer_token: Option<String>,
    submitted: SubmittedJobs,
}

impl KubernetesBackend {
    pub fn new(config: KubernetesConfig, secrets_dir: Option<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let bearer_token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)
            .ok()
            .map(|t| t.trim().to_string());
        Self {
            client,
            config,
            secrets_dir,
            bearer_token,
            submitted: SubmittedJobs::default(),
        }
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.config.api_url, self.config.namespace
        )
    }

    fn pods_url(&self) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods",
            self.config.api_url, self.config.namespace
        )
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    fn runtime_uid(params_uid: Option<i64>) -> i64 {
        match params_uid {
            Some(uid) if uid >= MIN_RUNTIME_UID => uid,
            _ => DEFAULT_RUNTIME_UID,
        }
    }

    fn image_needs_pull_secret(&self, image: &str) -> bool {
        self.config
            .private_registries
            .iter()
            .any(|registry| image.starts_with(registry.as_str()))
    }

    fn krb5_sidecar(&self, uid: i64) -> Value {
        json!({
            "name": "krb5-renew",
            "image": KRB5_SIDECAR_IMAGE,
            "imagePullPolicy": "IfNotPresent",
            "command": ["kinit", "-kt", "/etc/secrets/keytab"],
            "volumeMounts": [
                {"name": "secrets", "mountPath": "/etc/secrets", "readOnly": true},
                {"name": "krb5-cache", "mountPath": "/tmp/krb5"}
            ],
            "env": [{"name": "KRB5CCNAME", "value": format!("/tmp/krb5/krb5cc_{uid}")}]
        })
    }

    fn voms_sidecar(&self) -> Value {
        json!({
            "name": "voms-proxy",
            "image": VOMS_SIDECAR_IMAGE,
            "imagePullPolicy": "IfNotPresent",
            "command": ["voms-proxy-init", "--out", "/tmp/proxy/x509up"],
            "volumeMounts": [
                {"name": "secrets", "mountPath": "/etc/secrets", "readOnly": true},
                {"name": "proxy-cache", "mountPath": "/tmp/proxy"}
            ]
        })
    }

    /// Assemble the backend-native job object.
    pub fn build_job_object(&self, job: &Job) -> Result<Value> {
        let params = match &job.backend_params {
            BackendParams::Kubernetes(p) => p,
            other => {
                return Err(JobError::Malformed(format!(
                    "kubernetes adapter got {other:?} parameters"
                )))
            }
        };
        let backend_job_id = format!("run-job-{}", job.job_id);
        let uid = Self::runtime_uid(params.uid);

        let mut env: Vec<Value> = job
            .env_vars
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        env.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        if let Some(dir) = &self.secrets_dir {
            for (name, value) in render_secrets(dir)? {
                env.push(json!({"name": name, "value": value}));
            }
        }

        let workspace = job.workflow_workspace.to_string_lossy().into_owned();
        let mut volume_mounts = Vec::new();
        let mut volumes = Vec::new();
        if job.shared_file_system {
            volume_mounts.push(json!({"name": "workspace", "mountPath": workspace}));
            volumes.push(json!({
                "name": "workspace",
                "hostPath": {"path": workspace}
            }));
        }

        for (index, repository) in job.cvmfs_mounts.iter().enumerate() {
            let volume_name = format!("cvmfs-{index}");
            volume_mounts.push(json!({
                "name": volume_name,
                "mountPath": format!("/cvmfs/{repository}"),
                "readOnly": true
            }));
            volumes.push(json!({
                "name": volume_name,
                "persistentVolumeClaim": {"claimName": format!("csi-cvmfs-{repository}")}
            }));
        }

        if self.secrets_dir.is_some() || job.credentials.kerberos || job.credentials.voms_proxy {
            volume_mounts.push(json!({
                "name": "secrets",
                "mountPath": "/etc/secrets",
                "readOnly": true
            }));
            volumes.push(json!({"name": "secrets", "secret": {"secretName": "job-secrets"}}));
        }

        let mut container = json!({
            "name": "job",
            "image": job.docker_img,
            "imagePullPolicy": "IfNotPresent",
            "command": ["bash", "-c"],
            "args": [encoded_command(&job.cmd)],
            "workingDir": workspace,
            "env": env,
            "volumeMounts": volume_mounts
        });
        let memory_limit = params
            .memory_limit
            .clone()
            .or_else(|| self.config.jobs_memory_limit.clone());
        if let Some(limit) = memory_limit {
            container["resources"] = json!({"limits": {"memory": limit}});
        }

        let mut init_containers: Vec<Value> = Vec::new();
        if job.credentials.kerberos {
            init_containers.push(self.krb5_sidecar(uid));
            volumes.push(json!({"name": "krb5-cache", "emptyDir": {}}));
            container["env"]
                .as_array_mut()
                .expect("env is an array")
                .push(json!({"name": "KRB5CCNAME", "value": format!("/tmp/krb5/krb5cc_{uid}")}));
            container["volumeMounts"]
                .as_array_mut()
                .expect("volumeMounts is an array")
                .push(json!({"name": "krb5-cache", "mountPath": "/tmp/krb5"}));
        }
        if job.credentials.voms_proxy {
            init_containers.push(self.voms_sidecar());
            volumes.push(json!({"name": "proxy-cache", "emptyDir": {}}));
            container["env"]
                .as_array_mut()
                .expect("env is an array")
                .push(json!({"name": "X509_USER_PROXY", "value": "/tmp/proxy/x509up"}));
            container["volumeMounts"]
                .as_array_mut()
                .expect("volumeMounts is an array")
                .push(json!({"name": "proxy-cache", "mountPath": "/tmp/proxy"}));
        }

        let mut pod_spec = json!({
            "containers": [container],
            "initContainers": init_containers,
            "volumes": volumes,
            "restartPolicy": "Never",
            "securityContext": {
                "runAsUser": uid,
                "runAsNonRoot": true
            }
        });
        if self.image_needs_pull_secret(&job.docker_img) {
            if let Some(secret) = &self.config.image_pull_secret {
                pod_spec["imagePullSecrets"] = json!([{"name": secret}]);
            }
        }

        let mut spec = json!({
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "name": backend_job_id,
                    "labels": {"job-name": backend_job_id}
                },
                "spec": pod_spec
            }
        });
        if let Some(timeout) = params.job_timeout {
            spec["activeDeadlineSeconds"] = json!(timeout);
        }

        Ok(json!({
            "kind": "Job",
            "apiVersion": "batch/v1",
            "metadata": {
                "name": backend_job_id,
                "namespace": self.config.namespace,
                "labels": {
                    "job-name": backend_job_id,
                    "workflow-uuid": job.workflow_uuid
                }
            },
            "spec": spec
        }))
    }

    async fn find_pod(&self, backend_job_id: &str) -> Result<Option<Value>> {
        let response = self
            .request(self.client.get(self.pods_url()))
            .query(&[("labelSelector", format!("job-name={backend_job_id}"))])
            .send()
            .await
            .map_err(classify_http_error)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }
        let list: Value = response.json().await.map_err(classify_http_error)?;
        Ok(list["items"].as_array().and_then(|items| items.first().cloned()))
    }
}

/// Pod phases and container states, mapped to the abstract probe.
fn probe_from_pod(pod: &Value) -> StatusProbe {
    let phase = pod["status"]["phase"].as_str().unwrap_or("Unknown");
    match phase {
        "Running" => StatusProbe::running(),
        "Succeeded" => StatusProbe::finished(),
        "Failed" => {
            let (exit_code, reason) = terminated_state(pod);
            StatusProbe::failed(exit_code, reason)
        }
        "Pending" => StatusProbe::unknown(waiting_reason(pod)),
        _ => StatusProbe::unknown(None),
    }
}

fn container_statuses(pod: &Value) -> Vec<Value> {
    let mut statuses = Vec::new();
    for key in ["containerStatuses", "initContainerStatuses"] {
        if let Some(list) = pod["status"][key].as_array() {
            statuses.extend(list.iter().cloned());
        }
    }
    statuses
}

fn terminated_state(pod: &Value) -> (Option<i32>, Option<String>) {
    for status in container_statuses(pod) {
        let terminated = &status["state"]["terminated"];
        if terminated.is_object() {
            let exit_code = terminated["exitCode"].as_i64().map(|c| c as i32);
            let reason = terminated["reason"]
                .as_str()
                .filter(|r| *r != "Completed" && *r != "Error")
                .map(String::from);
            return (exit_code, reason);
        }
    }
    (None, None)
}

/// Image-level waiting reasons on a pending pod are the stall signal the
/// monitor counts.
fn waiting_reason(pod: &Value) -> Option<String> {
    for status in container_statuses(pod) {
        if let Some(reason) = status["state"]["waiting"]["reason"].as_str() {
            if reason.contains("ErrImagePull")
                || reason.contains("ImagePullBackOff")
                || reason.contains("InvalidImageName")
            {
                return Some(reason.to_string());
            }
        }
    }
    None
}

#[async_trait]
impl ComputeBackend for KubernetesBackend {
    fn kind(&self) -> Backend {
        Backend::Kubernetes
    }

    async fn submit(&self, job: &Job) -> Result<String> {
        if let Some(existing) = self.submitted.get(job.job_id) {
            debug!(job_id = %job.job_id, "submit replay, returning existing job object");
            return Ok(existing);
        }
        let object = self.build_job_object(job)?;
        let backend_job_id = object["metadata"]["name"]
            .as_str()
            .expect("job object carries a name")
            .to_string();

        let response = self
            .request(self.client.post(self.jobs_url()))
            .json(&object)
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            // AlreadyExists: a previous attempt got through.
            self.submitted.record(job.job_id, &backend_job_id);
            return Ok(backend_job_id);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(job_id = %job.job_id, %status, "job object creation failed");
            return Err(classify_http_status(status, &body));
        }
        info!(job_id = %job.job_id, %backend_job_id, "created kubernetes job");
        self.submitted.record(job.job_id, &backend_job_id);
        Ok(backend_job_id)
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let Some(backend_job_id) = &job.backend_job_id else {
            return Ok(());
        };
        let url = format!("{}/{}", self.jobs_url(), backend_job_id);
        let response = self
            .request(self.client.delete(url))
            .query(&[("propagationPolicy", "Background")])
            .send()
            .await
            .map_err(|e| JobError::BackendStop(e.to_string()))?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(JobError::BackendStop(format!("{status}: {body}")))
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String> {
        let Some(backend_job_id) = &job.backend_job_id else {
            return Ok(String::new());
        };
        let Some(pod) = self.find_pod(backend_job_id).await? else {
            return Ok(String::new());
        };
        let Some(pod_name) = pod["metadata"]["name"].as_str() else {
            return Ok(String::new());
        };

        let mut logs = String::new();
        for status in container_statuses(&pod) {
            let Some(container) = status["name"].as_str() else {
                continue;
            };
            if status["state"]["terminated"].is_object() {
                let url = format!("{}/{}/log", self.pods_url(), pod_name);
                let response = self
                    .request(self.client.get(url))
                    .query(&[("container", container)])
                    .send()
                    .await
                    .map_err(classify_http_error)?;
                if response.status().is_success() {
                    logs.push_str(&response.text().await.map_err(classify_http_error)?);
                }
            } else if let Some(message) = status["state"]["waiting"]["message"].as_str() {
                logs.push_str(&format!("container {container} failed: {message}\n"));
            }
        }
        Ok(logs)
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe> {
        match self.find_pod(backend_job_id).await? {
            Some(pod) => Ok(probe_from_pod(&pod)),
            None => Ok(StatusProbe::unknown(None)),
        }
    }
}
