//! Persistence for jobs and cache entries.
//!
//! The controller shares a relational database with the rest of the
//! platform but touches exactly two tables: `job` and `job_cache`. Every
//! write here is a projection of an in-memory transition — during a process
//! lifetime the registry is authoritative, across restarts the database is.
//! One commit per status transition; no long-lived transactions.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::Result;
use crate::models::{Job, JobStatus, JobSummary};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS job (
    id TEXT PRIMARY KEY,
    backend TEXT NOT NULL,
    backend_job_id TEXT,
    workflow_uuid TEXT NOT NULL,
    workspace TEXT NOT NULL,
    docker_image TEXT NOT NULL,
    cmd TEXT NOT NULL,
    status TEXT NOT NULL,
    logs TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
CREATE TABLE IF NOT EXISTS job_cache (
    fingerprint TEXT PRIMARY KEY,
    result_path TEXT NOT NULL,
    access_timestamp TIMESTAMP NOT NULL
);
"#;

/// A persisted job row. Narrower than [`Job`]: the shared schema keeps only
/// what other components need across restarts.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: Uuid,
    pub backend: String,
    pub backend_job_id: Option<String>,
    pub workflow_uuid: String,
    pub workspace: String,
    pub docker_image: String,
    pub cmd: String,
    pub status: JobStatus,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRow {
    /// Summary shape for jobs that already left the registry. Fields the
    /// schema does not keep fall back to their submission defaults.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            cmd: self.cmd.clone(),
            cvmfs_mounts: Vec::new(),
            docker_img: self.docker_image.clone(),
            job_id: self.id,
            status: self.status,
            restart_count: 0,
            max_restart_count: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheRow {
    pub fingerprint: String,
    pub result_path: String,
    pub access_timestamp: DateTime<Utc>,
}

/// Handle to the two controller tables.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the controller tables if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn insert_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO job (id, backend, backend_job_id, workflow_uuid, workspace, \
             docker_image, cmd, status, logs, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(job.job_id.to_string())
        .bind(job.backend.to_string())
        .bind(job.backend_job_id.as_deref())
        .bind(&job.workflow_uuid)
        .bind(job.workflow_workspace.to_string_lossy().into_owned())
        .bind(&job.docker_img)
        .bind(&job.cmd)
        .bind(job.status.to_string())
        .bind(&job.logs)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_backend_job_id(&self, job_id: Uuid, backend_job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE job SET backend_job_id = $1, updated_at = $2 \
             WHERE id = $3 AND backend_job_id IS NULL",
        )
        .bind(backend_job_id)
        .bind(Utc::now())
        .bind(job_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(&self, job_id: Uuid, status: JobStatus) -> Result<()> {
        sqlx::query("UPDATE job SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status.to_string())
            .bind(Utc::now())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist a terminal (or running) transition together with its logs.
    pub async fn update_status_and_logs(
        &self,
        job_id: Uuid,
        status: JobStatus,
        logs: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE job SET status = $1, logs = $2, updated_at = $3 WHERE id = $4")
            .bind(status.to_string())
            .bind(logs)
            .bind(Utc::now())
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fetch_job(&self, job_id: Uuid) -> Result<Option<JobRow>> {
        let row = sqlx::query(
            "SELECT id, backend, backend_job_id, workflow_uuid, workspace, docker_image, \
             cmd, status, logs, created_at, updated_at FROM job WHERE id = $1",
        )
        .bind(job_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let id: String = row.get("id");
            let status: String = row.get("status");
            Ok(JobRow {
                id: Uuid::parse_str(&id)
                    .map_err(|e| crate::errors::JobError::Malformed(e.to_string()))?,
                backend: row.get("backend"),
                backend_job_id: row.get("backend_job_id"),
                workflow_uuid: row.get("workflow_uuid"),
                workspace: row.get("workspace"),
                docker_image: row.get("docker_image"),
                cmd: row.get("cmd"),
                status: status.parse()?,
                logs: row.get("logs"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn cache_lookup(&self, fingerprint: &str) -> Result<Option<CacheRow>> {
        let row = sqlx::query(
            "SELECT fingerprint, result_path, access_timestamp FROM job_cache \
             WHERE fingerprint = $1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| CacheRow {
            fingerprint: row.get("fingerprint"),
            result_path: row.get("result_path"),
            access_timestamp: row.get("access_timestamp"),
        }))
    }

    /// Insert or overwrite the cache row for a fingerprint.
    pub async fn cache_upsert(&self, fingerprint: &str, result_path: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_cache (fingerprint, result_path, access_timestamp) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (fingerprint) DO UPDATE \
             SET result_path = excluded.result_path, \
                 access_timestamp = excluded.access_timestamp",
        )
        .bind(fingerprint)
        .bind(result_path)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Refresh the access timestamp so external retention can evict by age.
    pub async fn cache_touch(&self, fingerprint: &str) -> Result<()> {
        sqlx::query("UPDATE job_cache SET access_timestamp = $1 WHERE fingerprint = $2")
            .bind(Utc::now())
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::models::JobRequest;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> JobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = JobStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn job() -> Job {
        JobRequest {
            docker_img: "busybox".to_string(),
            job_name: "j1".to_string(),
            workflow_uuid: "w1".to_string(),
            workflow_workspace: "/workflows/w1".to_string(),
            cmd: "echo hi".to_string(),
            ..Default::default()
        }
        .into_job(&ControllerConfig::default())
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_fetch_job() {
        let store = store().await;
        let j = job();
        store.insert_job(&j).await.unwrap();

        let row = store.fetch_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(row.id, j.job_id);
        assert_eq!(row.backend, "kubernetes");
        assert_eq!(row.status, JobStatus::Queued);
        assert!(row.backend_job_id.is_none());
        assert_eq!(row.summary().docker_img, "busybox");
    }

    #[tokio::test]
    async fn test_fetch_missing_job() {
        let store = store().await;
        assert!(store.fetch_job(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backend_job_id_write_once() {
        let store = store().await;
        let j = job();
        store.insert_job(&j).await.unwrap();

        store.set_backend_job_id(j.job_id, "pod-1").await.unwrap();
        // A second write is a no-op: the guard clause only matches NULL.
        store.set_backend_job_id(j.job_id, "pod-2").await.unwrap();
        let row = store.fetch_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(row.backend_job_id.as_deref(), Some("pod-1"));
    }

    #[tokio::test]
    async fn test_status_and_logs_update() {
        let store = store().await;
        let j = job();
        store.insert_job(&j).await.unwrap();

        store
            .update_status(j.job_id, JobStatus::Running)
            .await
            .unwrap();
        store
            .update_status_and_logs(j.job_id, JobStatus::Finished, "hi\n")
            .await
            .unwrap();

        let row = store.fetch_job(j.job_id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Finished);
        assert_eq!(row.logs, "hi\n");
    }

    #[tokio::test]
    async fn test_cache_upsert_lookup_touch() {
        let store = store().await;
        assert!(store.cache_lookup("deadbeef").await.unwrap().is_none());

        store
            .cache_upsert("deadbeef", "/workflows/w1/archive/deadbeef")
            .await
            .unwrap();
        let row = store.cache_lookup("deadbeef").await.unwrap().unwrap();
        assert_eq!(row.result_path, "/workflows/w1/archive/deadbeef");

        let before = row.access_timestamp;
        store
            .cache_upsert("deadbeef", "/workflows/w1/archive/other")
            .await
            .unwrap();
        let row = store.cache_lookup("deadbeef").await.unwrap().unwrap();
        assert_eq!(row.result_path, "/workflows/w1/archive/other");
        assert!(row.access_timestamp >= before);

        store.cache_touch("deadbeef").await.unwrap();
        let touched = store.cache_lookup("deadbeef").await.unwrap().unwrap();
        assert!(touched.access_timestamp >= row.access_timestamp);
    }
}
