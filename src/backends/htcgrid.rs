//! HTC-grid adapter: submission through the grid's CLI tools.
//!
//! Submission writes a submit description and a wrapper script into the
//! job's staging directory and hands them to the configured submit tool.
//! The wrapper restores the workspace inside the node's scratch directory,
//! runs the user command under the container runtime and stages produced
//! files back into the workspace root. With `unpacked_img` the image is
//! taken from the CVMFS unpacked area instead of being pulled.
//!
//! All executables are configurable so tests can point them at fakes.

use std::fs;
use std::path::PathBuf;
use std::process::Output;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::config::HtcGridConfig;
use crate::errors::{JobError, Result};
use crate::models::{Backend, BackendParams, Job};

use super::{encoded_command, staging_dir, ComputeBackend, StatusProbe, SubmittedJobs};

/// Grid job states as reported by the queue tools.
const JOB_STATUS_IDLE: &str = "1";
const JOB_STATUS_RUNNING: &str = "2";
const JOB_STATUS_REMOVED: &str = "3";
const JOB_STATUS_COMPLETED: &str = "4";
const JOB_STATUS_HELD: &str = "5";

pub struct HtcGridBackend {
    config: HtcGridConfig,
    cluster_regex: Regex,
    submitted: SubmittedJobs,
}

impl HtcGridBackend {
    pub fn new(config: HtcGridConfig) -> Self {
        let cluster_regex = Regex::new(r"(\d+)\.\d+").expect("static regex is valid");
        Self {
            config,
            cluster_regex,
            submitted: SubmittedJobs::default(),
        }
    }

    fn container_image(&self, job: &Job, unpacked: bool) -> String {
        if unpacked {
            format!(
                "{}/{}",
                self.config.unpacked_img_root.trim_end_matches('/'),
                job.docker_img
            )
        } else {
            format!("docker://{}", job.docker_img)
        }
    }

    /// The grid wrapper: stage in, run containerized, stage out, emit the
    /// exit code.
    pub fn grid_wrapper_script(&self, job: &Job, unpacked: bool) -> String {
        let workspace = job.workflow_workspace.to_string_lossy();
        let scratch = self.config.scratch_dir.to_string_lossy();
        let exit_file = staging_dir(job).join("exit_code");
        let image = self.container_image(job, unpacked);
        let command = encoded_command(&job.cmd);
        format!(
            "#!/bin/bash\n\
             scratch=$(mktemp -d {scratch}/conductor-XXXXXX)\n\
             trap 'rm -rf \"$scratch\"' EXIT\n\
             cp -a \"{workspace}/.\" \"$scratch/\"\n\
             singularity exec --bind \"$scratch\":\"{workspace}\" {image} bash -c '{command}'\n\
             code=$?\n\
             cp -a \"$scratch/.\" \"{workspace}/\"\n\
             echo \"$code\" > \"{exit_file}\"\n\
             exit \"$code\"\n",
            exit_file = exit_file.display(),
        )
    }

    /// Render the submit description referencing the wrapper script.
    pub fn submit_description(&self, job: &Job) -> Result<String> {
        let params = match &job.backend_params {
            BackendParams::HtcGrid(p) => p,
            other => {
                return Err(JobError::Malformed(format!(
                    "htc-grid adapter got {other:?} parameters"
                )))
            }
        };
        let staging = staging_dir(job);
        let mut description = format!(
            "executable = {wrapper}\n\
             universe = vanilla\n\
             output = {out}\n\
             error = {err}\n\
             log = {log}\n\
             should_transfer_files = NO\n",
            wrapper = staging.join("wrapper.sh").display(),
            out = staging.join("job.out").display(),
            err = staging.join("job.err").display(),
            log = staging.join("job.log").display(),
        );
        if let Some(group) = &params.accounting_group {
            description.push_str(&format!("accounting_group = {group}\n"));
        }
        if let Some(runtime) = &params.max_runtime {
            description.push_str(&format!("+MaxRuntime = {runtime}\n"));
        }
        description.push_str("queue\n");
        Ok(description)
    }

    fn write_submission_files(&self, job: &Job) -> Result<PathBuf> {
        let params = match &job.backend_params {
            BackendParams::HtcGrid(p) => p.clone(),
            _ => Default::default(),
        };
        let staging = staging_dir(job);
        fs::create_dir_all(&staging)?;

        let wrapper_path = staging.join("wrapper.sh");
        fs::write(&wrapper_path, self.grid_wrapper_script(job, params.unpacked_img))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&wrapper_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&wrapper_path, perms)?;
        }

        let description_path = staging.join("job.sub");
        fs::write(&description_path, self.submit_description(job)?)?;
        Ok(description_path)
    }

    async fn run_tool(&self, exec: &str, args: &[&str]) -> Result<(i32, String, String)> {
        debug!(exec, ?args, "running grid tool");
        let output: Output = Command::new(exec)
            .args(args)
            .output()
            .await
            .map_err(|e| JobError::BackendPermanent(format!("could not run {exec}: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        Ok((output.status.code().unwrap_or(-1), stdout, stderr))
    }

    fn classify_tool_failure(stderr: &str) -> JobError {
        let transient = ["Failed to connect", "timed out", "Connection refused"];
        if transient.iter().any(|needle| stderr.contains(needle)) {
            JobError::BackendTransient(stderr.to_string())
        } else {
            JobError::BackendPermanent(stderr.to_string())
        }
    }

    fn probe_from_queue_line(line: &str) -> Option<StatusProbe> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let status = *fields.first()?;
        let exit_code: Option<i32> = fields.get(1).and_then(|c| c.parse().ok());
        let probe = match status {
            JOB_STATUS_RUNNING => StatusProbe::running(),
            JOB_STATUS_COMPLETED => match exit_code {
                Some(0) => StatusProbe::finished(),
                code => StatusProbe::failed(code, None),
            },
            JOB_STATUS_HELD => {
                StatusProbe::failed(exit_code, Some("job held by the grid".to_string()))
            }
            JOB_STATUS_REMOVED => {
                StatusProbe::failed(exit_code, Some("job removed by the grid".to_string()))
            }
            JOB_STATUS_IDLE => StatusProbe::unknown(None),
            _ => StatusProbe::unknown(None),
        };
        Some(probe)
    }
}

#[async_trait]
impl ComputeBackend for HtcGridBackend {
    fn kind(&self) -> Backend {
        Backend::HtcGrid
    }

    async fn submit(&self, job: &Job) -> Result<String> {
        if let Some(existing) = self.submitted.get(job.job_id) {
            debug!(job_id = %job.job_id, "submit replay, returning existing cluster id");
            return Ok(existing);
        }
        let description_path = self.write_submission_files(job)?;
        let description = description_path.to_string_lossy().into_owned();

        let (code, stdout, stderr) = self
            .run_tool(&self.config.submit_exec, &["-terse", &description])
            .await?;
        if code != 0 {
            error!(job_id = %job.job_id, code, %stderr, "grid submission failed");
            return Err(Self::classify_tool_failure(&stderr));
        }
        let cluster_id = self
            .cluster_regex
            .captures(&stdout)
            .and_then(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| {
                JobError::BackendPermanent(format!(
                    "could not parse cluster id from submit output: {stdout}"
                ))
            })?;
        info!(job_id = %job.job_id, %cluster_id, "submitted grid job");
        self.submitted.record(job.job_id, &cluster_id);
        Ok(cluster_id)
    }

    async fn stop(&self, job: &Job) -> Result<()> {
        let Some(cluster_id) = &job.backend_job_id else {
            return Ok(());
        };
        let (code, _, stderr) = self
            .run_tool(&self.config.remove_exec, &[cluster_id.as_str()])
            .await
            .map_err(|e| JobError::BackendStop(e.to_string()))?;
        if code == 0 || stderr.contains("not found") || stderr.contains("Couldn't find") {
            return Ok(());
        }
        Err(JobError::BackendStop(stderr))
    }

    async fn fetch_logs(&self, job: &Job) -> Result<String> {
        let staging = staging_dir(job);
        let mut logs = fs::read_to_string(staging.join("job.out")).unwrap_or_default();
        match fs::read_to_string(staging.join("job.err")) {
            Ok(stderr) if !stderr.is_empty() => logs.push_str(&stderr),
            _ => {}
        }
        Ok(logs)
    }

    async fn poll_status(&self, backend_job_id: &str) -> Result<StatusProbe> {
        let (code, stdout, stderr) = self
            .run_tool(
                &self.config.query_exec,
                &[backend_job_id, "-af", "JobStatus", "ExitCode"],
            )
            .await?;
        if code != 0 {
            warn!(backend_job_id, %stderr, "queue query failed");
            return Ok(StatusProbe::unknown(None));
        }
        if let Some(probe) = Self::probe_from_queue_line(stdout.trim()) {
            return Ok(probe);
        }

        // Completed jobs leave the queue; consult the history tool.
        let (code, stdout, _) = self
            .run_tool(
                &self.config.history_exec,
                &[backend_job_id, "-af", "JobStatus", "ExitCode", "-limit", "1"],
            )
            .await?;
        if code == 0 {
            if let Some(probe) = Self::probe_from_queue_line(stdout.trim()) {
                return Ok(probe);
            }
        }
        Ok(StatusProbe::unknown(Some(
            "job not known to queue or history".to_string(),
        )))
    }
}
