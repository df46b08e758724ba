//! HPC batch adapter: Slurm on a remote head node, driven over SSH.
//!
//! Submission generates a batch script with the requested partition and
//! walltime, transfers it to the head node, submits it and parses the
//! assigned job id. Status is polled through the accounting tool, results
//! land in the workspace (shared between controller and cluster), and logs
//! are read back from the batch output file.

use std::fs;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::HpcConfig;
use crate::errors::{JobError, Result};
use crate::models::{Backend, BackendParams, Job};

use super::{staging_dir, write_wrapper_script, ComputeBackend, StatusProbe, SubmittedJobs};

/// Slurm states grouped by outcome.
const FAILED_STATES: &[&str] = &[
    "BOOT_FAIL",
    "CANCELLED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
    "SUSPENDED",
    "STOPPED",
];
const FINISHED_STATES: &[&str] = &["COMPLETED"];
const RUNNING_STATES: &[&str] = &["CONFIGURING", "COMPLETING", "RUNNING", "STAGE_OUT"];

/// SSH exits with 255 on connection-level failures.
const SSH_CONNECTION_FAILURE: i32 = 255;

pub struct HpcBatchBackend {
    config: HpcConfig,
    sbatch_regex: Regex,
    submitted: SubmittedJobs,
}

impl HpcBatchBackend {
    pub fn new(config: HpcConfig) -> Self {
        let sbatch_regex =
            Regex::new(r"Submitted batch job (\d+)").expect("static regex is valid");
        Self {
            config,
            sbatch_regex,
            submitted: SubmittedJobs::default(),
        }
    }

    fn ssh_destination(&self) -> String {
        match &self.config.ssh_user {
            Some(user) => format!("{user}@{}", self.config.head_node),
            None => self.config.head_node.clone(),
        }
    }

    async fn run_remote(&self, remote_command: &str) -> Result<(i32, String, String)> {
        let destination = self.ssh_destination();
        let port = self.config.ssh_port.to_string();
        debug!(%destination, remote_command, "running remote command");
        let output = Command::new(&self.config.ssh_exec)
            .args(["-p", &port, &destination, remote_command])
            .output()
            .await
            .map_err(|e| {
                JobError::BackendPermanent(format!(
                    "could not run {}: {e}",
                    self.config.ssh_exec
                ))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((output.status.code().unwrap_or(-1), stdout, stderr))
    }

    async fn transfer_file(&self, local: &str, remote: &str) -> Result<()> {
        let destination = format!("{}:{remote}", self.ssh_destination());
        let port = self.config.ssh_port.to_string();
        let output = Command::new(&self.config.scp_exec)
            .args(["-P", &port, local, &destination])
            .output()
            .await
            .map_err(|e| {
                JobError::BackendPermanent(format!(
                    "could not run {}: {e}",
                    self.config.scp_exec
                ))
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Self::classify_remote_failure(
                output.status.code().unwrap_or(-1),
                &stderr,
            ));
        }
        Ok(())
    }

    fn classify_remote_failure(code: i32, stderr: &str) -> JobError {
        if code == SSH_CONNECTION_FAILURE
            || stderr.contains("Connection refused")
            || stderr.contains("Connection timed out")
        {
            JobError::BackendTransient(stderr.to_string())
        } else {
            JobError::BackendPermanent(stderr.to_string())
        }
    }

    /// The batch script submitted on the head node. The command runs inside
    /// the container runtime against the shared workspace.
    pub fn batch_script(&self, job: &Job) -> Result<String> {
        let params = match &job.backend_params {
            BackendParams::HpcBatch(p) => p,
            other => {
                return Err(JobError::Malformed(format!(
                    "hpc-batch adapter got {other:?} parameters"
                )))
            }
        };
        let staging = staging_dir(job);
        let workspace = job.workflow_workspace.to_string_lossy();
        let mut script = format!(
            "#!/bin/bash\n\
             #SBATCH --job-name={name}\n\
             #SBATCH --output={out}\n\
             #SBATCH --error={out}\n",
            name = job.job_name,
            out = staging.join("batch.out").display(),
        );
        if let Some(partition) = &params.partition {
            script.push_str(&format!("#SBATCH --partition={partition}\n"));
        }
        if let Some(time) = &params.time {
            script.push_str(&format!("#SBATCH --time={time}\n"));
        }
        // The shared wrapper decodes the command, runs it and emits the
        // exit code into the staging directory.
        script.push_str(&format!(
            "\ncd \"{workspace}\"\n\
             srun singularity exec --bind \"{workspace}\":\"{workspace}\" \
             docker://{image} bash \"{wrapper}\"\n",
            image = job.docker_img,
            wrapper = staging.join("wrapper.sh").display(),
        ));
        Ok(script)
    }

    fn probe_from_state(state: &str, exit_code: Option<i32>) -> StatusProbe {
        if FINISHED_STATES.contains(&state) {
            return match exit_code {
                Some(0) | None => StatusProbe::finished(),
                code => StatusProbe::failed(code, None),
            };
        }
        if FAILED_STATES.contains(&state) {
            let diagnostic = match state {
                "OUT_OF_MEMORY" => Some("out of memory".to_string()),
                "TIMEOUT" | "DEADLINE" => Some("walltime exceeded".to_string()),
                "NODE_FAIL" => Some("node failure".to_string()),
                _ => None,
            };
            return StatusProbe::failed(exit_code, diagnostic);
        }
        if RUNNING_STATES.contains(&state) {
            return StatusProbe::running();
        }
        // PENDING, REQUEUED and the other idle states.
        StatusProbe::unknown(None)
    }

    /// Parse one `sacct --parsable2 --format State,ExitCode` line, e.g.
    /// `COMPLETED|0:0` or `FAILED|2:0`.
    fn parse_accounting_line(line: &str) -> Option<StatusProbe> {
        let mut fields = line.trim().split('|');
        let state = fields.next()?.trim();
        if state.is_empty() {
            return None;
        }
        // CANCELLED can appear as "CANCELLED by <uid>".
        let state = state.split_whitespace().next()?;
        let exit_code = fields
            .next()
            .and_then(|c| c.split(':').next())
            .and_then(|c| c.parse().ok());
        Some(Self::probe_from_state(state, exit_code))
    }
}

#[async_trait]
impl ComputeBackend for HpcBatchBackend {
    fn kind(&self) -> Backend {
        Backend::HpcBatch
    }

    async fn submit(&self, job: &Job) -> Result<String> {
        if let Some(existing) = self.submitted.get(job.job_id) {
            debug!(job_id = %job.job_id, "submit replay, returning existing batch id");
            return Ok(existing);
        }

        let staging = staging_dir(job);
        fs::create_dir_all(&staging)?;
        write_wrapper_script(job)?;
        let script_path = staging.join("batch.sh");
        fs::write(&script_path, self.batch_script(job)?)?;
        let script = script_path.to_string_lossy().into_owned();

        // The workspace is shared with the cluster, but the script is still
        // transferred explicitly so the head node never depends on mount
        // propagation timing.
        let staging_remote = staging.to_string_lossy().into_owned();
        let (code, _, stderr) = self
            .run_remote(&format!("mkdir -p \"{staging_remote}\""))
            .await?;
        if code != 0 {
            return Err(Self::classify_remote_failure(code, &stderr));
        }
        self.transfer_file(&script, &script).await?;

        let (code, stdout, stderr) = self
            .run_remote(&format!("{} \"{script}\"", self.config.sbatch_exec))
            .await?;
        if code != 0 {
            error!(job_id = %job.job_id, code, %stderr, "batch submission failed");
            return Err(Self::classify_remote_failure(code, &stderr));
        }
        let batch_id = self
            .sbatch_regex
            .captures(&stdout)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                JobError::BackendPermanent(format!(
                    "could not parse job id from sbatch output: {stdout}"
                ))
            })?;
        info!(job_id = %job.job_id, %batch_id, "submitted batch job");
        self.submitted.record(job.job_id, &batch_id);
        Ok(batch_id)
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let Some(batch_id) = &job.backend_job_id else {
            return Ok(());
        };
        let (code, _, stderr) = self
            .run_remote(&format!("{} {batch_id}", self.config.scancel_exec))
            .await
            .map_err(|e| JobError::BackendStop(e.to_string()))?;
        if code == 0 || stderr.contains("Invalid job id specified") {
            return Ok(());
        }
        Err(JobError::BackendStop(stderr))
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String> {
        // Output lands in the shared workspace; read it locally first and
        // fall back to the head node if the mount lags behind.
        let out_path = staging_dir(job).join("batch.out");
        if let Ok(logs) = fs::read_to_string(&out_path) {
            return Ok(logs);
        }
        let (code, stdout, _) = self
            .run_remote(&format!("cat \"{}\"", out_path.display()))
            .await?;
        if code == 0 {
            Ok(stdout)
        } else {
            Ok(String::new())
        }
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe> {
        let query = format!(
            "{} --jobs {backend_job_id} --noheader --allocations --parsable2 --format State,ExitCode",
            self.config.sacct_exec
        );
        let (code, stdout, stderr) = self.run_remote(&query).await?;
        if code != 0 {
            warn!(backend_job_id, %stderr, "accounting query failed");
            return Err(Self::classify_remote_failure(code, &stderr));
        }
        Ok(Self::parse_accounting_line(&stdout)
            .unwrap_or_else(|| StatusProbe::unknown(Some("job not in accounting".to_string()))))
    }
}
