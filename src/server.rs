//! HTTP surface: thin axum handlers over [`JobOrchestrator`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::cors::CorsPolicy;
use crate::error::SpectraError;
use crate::job::{JobStatus, ProjectContext};
use crate::orchestrator::{Dispatch, JobOrchestrator, TriggerOutcome};

const SERVICE: &str = "spectra-api";
const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn router(orchestrator: Arc<JobOrchestrator>, cors: &CorsPolicy) -> Router {
    Router::new()
        .route("/", get(root).post(generate))
        .route("/jobs", post(create_job))
        .route("/job/:job_id", get(job_status))
        .route("/process/:job_id", post(process_job))
        .route("/health", get(health))
        .layer(cors.layer())
        .with_state(orchestrator)
}

pub async fn serve(
    orchestrator: Arc<JobOrchestrator>,
    cors: &CorsPolicy,
    bind: &str,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(
        addr = %listener.local_addr()?,
        any_origin = cors.allows_any_origin(),
        "listening"
    );
    axum::serve(listener, router(orchestrator, cors))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "service": "Spectra API",
        "version": VERSION,
        "endpoints": ["POST /", "POST /jobs", "GET /job/{id}", "POST /process/{id}", "GET /health"],
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "service": SERVICE, "version": VERSION}))
}

/// Template hit returns the artifacts themselves; a miss returns the job handle.
async fn generate(
    State(orch): State<Arc<JobOrchestrator>>,
    Json(context): Json<ProjectContext>,
) -> Response {
    match orch.dispatch(context).await {
        Dispatch::Template(files) => Json(files).into_response(),
        Dispatch::Queued { job_id, status } => queued(job_id, status),
    }
}

async fn create_job(
    State(orch): State<Arc<JobOrchestrator>>,
    Json(context): Json<ProjectContext>,
) -> Response {
    match orch.dispatch(context).await {
        Dispatch::Template(files) => {
            Json(json!({"status": JobStatus::Completed, "result": files})).into_response()
        }
        Dispatch::Queued { job_id, status } => queued(job_id, status),
    }
}

async fn job_status(
    State(orch): State<Arc<JobOrchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orch.query(&job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => error_response(err),
    }
}

async fn process_job(
    State(orch): State<Arc<JobOrchestrator>>,
    Path(job_id): Path<String>,
) -> Response {
    match orch.trigger(&job_id).await {
        Ok(TriggerOutcome::Processed { job_id }) => {
            Json(json!({"message": "Job processed", "job_id": job_id})).into_response()
        }
        Ok(TriggerOutcome::Unchanged { status, .. }) => {
            Json(json!({"message": format!("Job {status}")})).into_response()
        }
        Err(err) => error_response(err),
    }
}

fn queued(job_id: String, status: JobStatus) -> Response {
    Json(json!({"job_id": job_id, "status": status})).into_response()
}

fn error_response(err: SpectraError) -> Response {
    let (status, code) = match &err {
        SpectraError::JobNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        SpectraError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
        SpectraError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
        SpectraError::Generation(_) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_error"),
    };
    json_error(status, code, err.to_string())
}

fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
