//! HTTP surface: a thin translation of the REST endpoints onto manager,
//! registry and cache calls. No business logic lives here.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::errors::JobError;
use crate::manager::JobManager;
use crate::models::{JobRequest, JobSummary};
use crate::shutdown::ShutdownCoordinator;

/// Shared state handed to every handler.
pub struct AppState {
    pub manager: Arc<JobManager>,
    pub coordinator: Arc<ShutdownCoordinator>,
}

/// Build the controller's router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", post(create_job).get(list_jobs))
        .route("/jobs/{job_id}", get(get_job).delete(delete_job))
        .route("/jobs/{job_id}/", delete(delete_job))
        .route("/jobs/{job_id}/logs", get(get_logs))
        .route("/job_cache", get(check_cache))
        .route("/shutdown", delete(shutdown))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn message(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(json!({"message": text.into()}))).into_response()
}

fn unknown_job(job_id: &str) -> Response {
    message(
        StatusCode::NOT_FOUND,
        format!("The job {job_id} doesn't exist"),
    )
}

async fn create_job(State(state): State<Arc<AppState>>, body: axum::body::Bytes) -> Response {
    if !state.coordinator.accepting_submissions() {
        return message(StatusCode::SERVICE_UNAVAILABLE, "Controller is shutting down");
    }
    if body.is_empty() {
        return message(StatusCode::BAD_REQUEST, "Empty request");
    }
    let request: JobRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return message(StatusCode::BAD_REQUEST, err.to_string()),
    };
    match state.manager.execute(request).await {
        Ok(job_id) => (StatusCode::CREATED, Json(json!({"job_id": job_id}))).into_response(),
        Err(JobError::Malformed(reason)) => message(StatusCode::BAD_REQUEST, reason),
        Err(err) => {
            error!(%err, "job submission failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Job could not be allocated")
        }
    }
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Response {
    let jobs: HashMap<String, JobSummary> = state
        .manager
        .registry()
        .snapshot()
        .iter()
        .map(|(job_id, job)| (job_id.to_string(), JobSummary::from(job)))
        .collect();
    Json(json!({"jobs": jobs})).into_response()
}

async fn get_job(State(state): State<Arc<AppState>>, UrlPath(job_id): UrlPath<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&job_id) else {
        return unknown_job(&job_id);
    };
    match state.manager.job_summary(id).await {
        Ok(Some(summary)) => Json(json!({"job": summary})).into_response(),
        Ok(None) => unknown_job(&job_id),
        Err(err) => {
            error!(%err, "job lookup failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal controller error")
        }
    }
}

async fn get_logs(State(state): State<Arc<AppState>>, UrlPath(job_id): UrlPath<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&job_id) else {
        return unknown_job(&job_id);
    };
    match state.manager.job_logs(id).await {
        Ok(Some(logs)) => Json(json!({"log": logs})).into_response(),
        Ok(None) => unknown_job(&job_id),
        Err(err) => {
            error!(%err, "log lookup failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal controller error")
        }
    }
}

async fn delete_job(
    State(state): State<Arc<AppState>>,
    UrlPath(job_id): UrlPath<String>,
    Query(_params): Query<HashMap<String, String>>,
) -> Response {
    let Ok(id) = Uuid::parse_str(&job_id) else {
        return unknown_job(&job_id);
    };
    match state.manager.stop(id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(JobError::NotFound(_)) => unknown_job(&job_id),
        Err(JobError::BackendStop(reason)) => message(
            StatusCode::BAD_GATEWAY,
            format!("Connection to compute backend failed:\n{reason}"),
        ),
        Err(err) => {
            error!(%err, "job stop failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal controller error")
        }
    }
}

async fn check_cache(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let (Some(job_spec), Some(workflow_json), Some(workspace)) = (
        params.get("job_spec"),
        params.get("workflow_json"),
        params.get("workflow_workspace"),
    ) else {
        return message(
            StatusCode::BAD_REQUEST,
            "job_spec, workflow_json and workflow_workspace are required",
        );
    };
    let job_spec: Value = match serde_json::from_str(job_spec) {
        Ok(value) => value,
        Err(err) => return message(StatusCode::BAD_REQUEST, format!("bad job_spec: {err}")),
    };
    let workflow_json: Value = match serde_json::from_str(workflow_json) {
        Ok(value) => value,
        Err(err) => return message(StatusCode::BAD_REQUEST, format!("bad workflow_json: {err}")),
    };
    match state
        .manager
        .cache()
        .check(&job_spec, &workflow_json, Path::new(workspace))
        .await
    {
        Ok(Some(hit)) => Json(json!({
            "cached": true,
            "result_path": hit.result_path,
        }))
        .into_response(),
        Ok(None) => Json(json!({"cached": false, "result_path": Value::Null})).into_response(),
        Err(err) => {
            error!(%err, "cache check failed");
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal controller error")
        }
    }
}

async fn shutdown(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.shutdown().await {
        Ok(()) => Json(json!({"message": "All jobs stopped"})).into_response(),
        Err(remaining) => {
            let ids: Vec<String> = remaining.iter().map(Uuid::to_string).collect();
            message(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Could not stop jobs {}", ids.join(", ")),
            )
        }
    }
}
