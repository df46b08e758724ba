//! Remote-HTC adapter: submission through a token-authenticated gateway.
//!
//! The gateway fronts an HTC pool outside our infrastructure. Every request
//! carries a machine token obtained from the configured issuer; tokens are
//! cached until shortly before expiry. Job payloads carry the base64-wrapped
//! command and the pool-specific sizing parameters.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::RemoteHtcConfig;
use crate::errors::{JobError, Result};
use crate::models::{Backend, BackendParams, Job};

use super::{
    classify_http_error, classify_http_status, encoded_command, ComputeBackend, StatusProbe,
    SubmittedJobs,
};

/// Refresh the machine token this long before the issuer says it expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct RemoteHtcBackend {
    client: reqwest::Client,
    config: RemoteHtcConfig,
    token: Mutex<Option<CachedToken>>,
    submitted: SubmittedJobs,
}

impl RemoteHtcBackend {
    pub fn new(config: RemoteHtcConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            config,
            token: Mutex::new(None),
            submitted: SubmittedJobs::default(),
        }
    }

    async fn machine_token(&self) -> Result<String> {
        if let Some(token) = &self.config.token {
            return Ok(token.clone());
        }
        {
            let cached = self.token.lock().expect("token mutex poisoned");
            if let Some(token) = cached.as_ref() {
                if token.expires_at.saturating_duration_since(Instant::now())
                    > TOKEN_EXPIRY_MARGIN
                {
                    return Ok(token.value.clone());
                }
            }
        }

        debug!(issuer = %self.config.token_issuer_url, "requesting machine token");
        let response = self
            .client
            .post(&self.config.token_issuer_url)
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }
        let body: Value = response.json().await.map_err(classify_http_error)?;
        let value = body["access_token"]
            .as_str()
            .ok_or_else(|| {
                JobError::BackendPermanent("token issuer response lacks access_token".to_string())
            })?
            .to_string();
        let expires_in = body["expires_in"].as_u64().unwrap_or(300);

        let mut cached = self.token.lock().expect("token mutex poisoned");
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(value)
    }

    fn jobs_url(&self) -> String {
        format!("{}/jobs", self.config.gateway_url.trim_end_matches('/'))
    }

    /// The gateway-native job payload.
    pub fn build_payload(&self, job: &Job) -> Result<Value> {
        let params = match &job.backend_params {
            BackendParams::RemoteHtc(p) => p,
            other => {
                return Err(JobError::Malformed(format!(
                    "remote-htc adapter got {other:?} parameters"
                )))
            }
        };
        let mut payload = json!({
            "name": job.job_name,
            "image": job.docker_img,
            "command": encoded_command(&job.cmd),
            "environment": job.env_vars,
            "workspace": job.workflow_workspace,
        });
        if let Some(cores) = params.cpu_cores {
            payload["cpu_cores"] = json!(cores);
        }
        if let Some(memory) = &params.memory_limit {
            payload["memory_limit"] = json!(memory);
        }
        if let Some(requirements) = &params.additional_requirements {
            payload["additional_requirements"] = json!(requirements);
        }
        Ok(payload)
    }

    fn probe_from_response(body: &Value) -> StatusProbe {
        let exit_code = body["exit_code"].as_i64().map(|c| c as i32);
        match body["status"].as_str().unwrap_or("unknown") {
            "running" => StatusProbe::running(),
            "completed" | "finished" => match exit_code {
                Some(0) | None => StatusProbe::finished(),
                code => StatusProbe::failed(code, None),
            },
            "failed" => StatusProbe::failed(
                exit_code,
                body["reason"].as_str().map(String::from),
            ),
            "pending" | "queued" => StatusProbe::unknown(None),
            other => StatusProbe::unknown(Some(format!("gateway reported '{other}'"))),
        }
    }
}

#[async_trait]
impl ComputeBackend for RemoteHtcBackend {
    fn kind(&self) -> Backend {
        Backend::RemoteHtc
    }

    async fn submit(&self, job: &Job) -> Result<String> {
        if let Some(existing) = self.submitted.get(job.job_id) {
            debug!(job_id = %job.job_id, "submit replay, returning existing gateway id");
            return Ok(existing);
        }
        let token = self.machine_token().await?;
        let payload = self.build_payload(job)?;

        let response = self
            .client
            .post(self.jobs_url())
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(job_id = %job.job_id, %status, "gateway submission failed");
            return Err(classify_http_status(status, &body));
        }
        let body: Value = response.json().await.map_err(classify_http_error)?;
        let backend_job_id = body["job_id"]
            .as_str()
            .ok_or_else(|| {
                JobError::BackendPermanent("gateway response lacks job_id".to_string())
            })?
            .to_string();
        info!(job_id = %job.job_id, %backend_job_id, "submitted gateway job");
        self.submitted.record(job.job_id, &backend_job_id);
        Ok(backend_job_id)
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let Some(backend_job_id) = &job.backend_job_id else {
            return Ok(());
        };
        let token = self
            .machine_token()
            .await
            .map_err(|e| JobError::BackendStop(e.to_string()))?;
        let response = self
            .client
            .delete(format!("{}/{backend_job_id}", self.jobs_url()))
            .bearer_auth(token)
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
        let token = self.machine_token().await?;
        let response = self
            .client
            .get(format!("{}/{backend_job_id}/logs", self.jobs_url()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_http_error)?;
        if !response.status().is_success() {
            return Ok(String::new());
        }
        response.text().await.map_err(classify_http_error)
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe> {
        let token = self.machine_token().await?;
        let response = self
            .client
            .get(format!("{}/{backend_job_id}", self.jobs_url()))
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_http_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(StatusProbe::unknown(Some(
                "job not known to the gateway".to_string(),
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_status(status, &body));
        }
        let body: Value = response.json().await.map_err(classify_http_error)?;
        Ok(Self::probe_from_response(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::BackendPhase;
    use crate::config::ControllerConfig;
    use crate::models::JobRequest;

    fn gateway_job(mutate: impl FnOnce(&mut JobRequest)) -> Job {
        let mut request = JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: "/workflows/w1".to_string(),
            cmd: "echo hi".to_string(),
            compute_backend: Backend::RemoteHtc,
            ..Default::default()
        };
        mutate(&mut request);
        request.into_job(&ControllerConfig::default()).unwrap()
    }

    fn backend() -> RemoteHtcBackend {
        RemoteHtcBackend::new(RemoteHtcConfig {
            token: Some("static-token".to_string()),
            ..RemoteHtcConfig::default()
        })
    }

    #[test]
    fn test_payload_carries_sizing_params() {
        let job = gateway_job(|r| {
            r.c4p_cpu_cores = Some(4);
            r.c4p_memory_limit = Some("16G".to_string());
            r.c4p_additional_requirements = Some("gpu".to_string());
        });
        let payload = backend().build_payload(&job).unwrap();
        assert_eq!(payload["name"], "j1");
        assert_eq!(payload["image"], "busybox");
        assert_eq!(payload["cpu_cores"], 4);
        assert_eq!(payload["memory_limit"], "16G");
        assert_eq!(payload["additional_requirements"], "gpu");
        let command = payload["command"].as_str().unwrap();
        assert!(command.contains("base64 -d"));
        assert!(!command.contains("echo hi"));
    }

    #[test]
    fn test_payload_omits_unset_params() {
        let payload = backend().build_payload(&gateway_job(|_| {})).unwrap();
        assert!(payload.get("cpu_cores").is_none());
        assert!(payload.get("memory_limit").is_none());
    }

    #[test]
    fn test_probe_from_response() {
        let running = json!({"status": "running"});
        assert_eq!(
            RemoteHtcBackend::probe_from_response(&running).phase,
            BackendPhase::Running
        );

        let finished = json!({"status": "completed", "exit_code": 0});
        assert_eq!(
            RemoteHtcBackend::probe_from_response(&finished).phase,
            BackendPhase::Finished
        );

        let failed = json!({"status": "failed", "exit_code": 2, "reason": "command failed"});
        let probe = RemoteHtcBackend::probe_from_response(&failed);
        assert_eq!(probe.phase, BackendPhase::Failed);
        assert_eq!(probe.exit_code, Some(2));
        assert_eq!(probe.diagnostic.as_deref(), Some("command failed"));

        let queued = json!({"status": "queued"});
        assert_eq!(
            RemoteHtcBackend::probe_from_response(&queued).phase,
            BackendPhase::Unknown
        );
    }

    #[tokio::test]
    async fn test_static_token_short_circuits_issuer() {
        // With a static token configured, no issuer round-trip happens.
        let token = backend().machine_token().await.unwrap();
        assert_eq!(token, "static-token");
    }
}
