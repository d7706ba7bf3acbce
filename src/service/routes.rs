//! Axum routes for the Edit Plan service.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use crate::job::{JobError, StageResult};
use crate::progress::ProgressPublisher;
use crate::store::{CheckpointStore, JobStore, PostgresStore};
use crate::types::{Blueprint, Checkpoint, JobId, JobRecord, JobSpec, JobStatus};
use crate::EDIT_PLAN_SCHEMA_VERSION;

use super::middleware::record_stage_result;
use super::state::{ServiceState, ServiceStore, StoreHealth};

/// Type alias for the service state with PostgresStore.
pub type AppState = ServiceState<PostgresStore>;

type ApiError = (StatusCode, Json<ErrorResponse>);

type EventStream = Pin<Box<dyn Stream<Item = Result<Event, Infallible>> + Send>>;

// ============================================================================
// Request/Response Types
// ============================================================================

/// List of jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobListResponse {
    /// Job records, oldest first.
    pub jobs: Vec<JobRecord>,
    /// Number of jobs.
    pub count: usize,
}

/// Response to a background run request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAcceptedResponse {
    /// Job being run.
    pub job_id: JobId,
    /// Status when the run was accepted.
    pub status: JobStatus,
}

/// Service health response (detailed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub schema_version: String,
    pub planner_version: String,
    /// Hash of the planner parameters every new blueprint is planned with.
    pub planner_params_hash: String,
    /// Database connectivity status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseHealth>,
}

/// Database health information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub connected: bool,
    pub pool_size: u32,
    pub pool_idle: usize,
    pub pool_max: u32,
}

/// Simple liveness response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub status: String,
}

/// Readiness response with dependency status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub store: bool,
    pub details: Option<String>,
}

/// Structured error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable error code.
    pub code: String,
    /// Additional error details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response with code and message.
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    /// Add details to the error.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    let body = ErrorResponse::new(code, error);
    tracing::warn!(code = %body.code, error = %body.error, "Request error");
    (status, Json(body))
}

fn job_error(e: JobError) -> ApiError {
    let (status, code) = match &e {
        JobError::NotFound(_) => (StatusCode::NOT_FOUND, "JOB_NOT_FOUND"),
        JobError::StageInFlight { .. } => (StatusCode::CONFLICT, "STAGE_IN_FLIGHT"),
        JobError::StageCompleted { .. } => (StatusCode::CONFLICT, "STAGE_COMPLETED"),
        JobError::Terminal { .. } => (StatusCode::CONFLICT, "JOB_TERMINAL"),
        JobError::NotResumable { .. } => (StatusCode::CONFLICT, "NOT_RESUMABLE"),
        JobError::MissingCheckpoint { .. } => (StatusCode::CONFLICT, "MISSING_CHECKPOINT"),
        JobError::CorruptCheckpoint { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "CORRUPT_CHECKPOINT"),
        JobError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
    };
    api_error(status, code, e.to_string())
}

fn store_error<E: std::error::Error>(e: E) -> ApiError {
    job_error(JobError::from_store(e))
}

fn parse_job_id(id: &str) -> Result<JobId, ApiError> {
    JobId::from_str(id).map_err(|e| {
        let (status, Json(body)) =
            api_error(StatusCode::BAD_REQUEST, "INVALID_JOB_ID", format!("Invalid job ID: {}", e));
        (status, Json(body.with_details(id.to_string())))
    })
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Register a new job.
async fn create_job_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Json(spec): Json<JobSpec>,
) -> Result<(StatusCode, Json<JobRecord>), ApiError> {
    if spec.name.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "INVALID_SPEC", "Job name is empty"));
    }
    if !(spec.target_frame_rate.is_finite() && spec.target_frame_rate > 0.0) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_SPEC",
            format!("Invalid frame rate: {}", spec.target_frame_rate),
        ));
    }
    let record = state.machine.create(spec).await.map_err(job_error)?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// List every job.
async fn list_jobs_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Result<Json<JobListResponse>, ApiError> {
    let jobs = state.store().list_jobs().await.map_err(store_error)?;
    Ok(Json(JobListResponse { count: jobs.len(), jobs }))
}

/// Get one job record.
async fn get_job_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.machine.get(job_id).await.map_err(job_error)?))
}

/// Run the next stage.
async fn advance_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<StageResult>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let start = Instant::now();
    let result = state.machine.advance(job_id).await.map_err(job_error)?;
    record_stage_result("advance", &result, start.elapsed().as_millis() as u64);
    Ok(Json(result))
}

/// Resume a failed or interrupted job.
async fn resume_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<StageResult>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let start = Instant::now();
    let result = state.machine.resume(job_id).await.map_err(job_error)?;
    record_stage_result("resume", &result, start.elapsed().as_millis() as u64);
    Ok(Json(result))
}

/// Run a job to a stop in the background.
async fn run_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<RunAcceptedResponse>), ApiError> {
    let job_id = parse_job_id(&id)?;
    let record = state.machine.get(job_id).await.map_err(job_error)?;
    if record.status.is_terminal() {
        return Err(job_error(JobError::Terminal { job_id, status: record.status }));
    }
    if let Some(stage) = record.active_stage {
        return Err(job_error(JobError::StageInFlight { job_id, stage }));
    }

    let machine = state.machine.clone();
    tokio::spawn(async move {
        let start = Instant::now();
        match machine.run(job_id).await {
            Ok(result) => record_stage_result("run", &result, start.elapsed().as_millis() as u64),
            Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Background run stopped"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAcceptedResponse { job_id, status: record.status }),
    ))
}

/// Request cancellation.
async fn cancel_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.machine.cancel(job_id).await.map_err(job_error)?))
}

/// Newest checkpoint of a job.
async fn latest_checkpoint_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    let job_id = parse_job_id(&id)?;
    state.machine.get(job_id).await.map_err(job_error)?;
    state
        .store()
        .latest(job_id)
        .await
        .map_err(store_error)?
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NO_CHECKPOINT", "Job has no checkpoints yet"))
}

/// Planned blueprint of a job.
async fn blueprint_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<Blueprint>, ApiError> {
    let job_id = parse_job_id(&id)?;
    state.machine.get(job_id).await.map_err(job_error)?;
    let checkpoints = state.store().checkpoint_set(job_id).await.map_err(store_error)?;
    checkpoints
        .blueprint()
        .cloned()
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "NO_BLUEPRINT", "Job has not been planned yet"))
}

/// Server-sent progress events.
///
/// The first event (`snapshot`) carries the job record; live `progress`
/// events follow until the job stops. Events missed while disconnected are
/// not replayed.
async fn progress_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
    Path(id): Path<String>,
) -> Result<Sse<EventStream>, ApiError> {
    let job_id = parse_job_id(&id)?;
    let record = state.machine.get(job_id).await.map_err(job_error)?;

    let snapshot = |record: &JobRecord| -> Result<Event, ApiError> {
        Event::default()
            .event("snapshot")
            .json_data(record)
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_FAILED", e.to_string()))
    };

    if record.status.is_terminal() {
        let head = tokio_stream::once(Ok(snapshot(&record)?));
        return Ok(Sse::new(Box::pin(head) as EventStream));
    }

    let receiver = state.progress.subscribe(job_id);
    // The job may have stopped (and closed its channel) before we subscribed.
    let record = state.machine.get(job_id).await.map_err(job_error)?;
    let head = tokio_stream::once(Ok(snapshot(&record)?));
    if record.status.is_terminal() {
        drop(receiver);
        state.progress.close(job_id);
        return Ok(Sse::new(Box::pin(head) as EventStream));
    }

    let live = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => Event::default().event("progress").json_data(&event).ok().map(Ok),
        Err(_) => None,
    });
    let stream: EventStream = Box::pin(head.chain(live));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Health check endpoint (detailed).
async fn health_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Json<HealthResponse> {
    let healthy = state.store().is_healthy().await;
    let planner = &state.machine.config().planner;

    Json(HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        schema_version: EDIT_PLAN_SCHEMA_VERSION.to_string(),
        planner_version: planner.planner_id().to_string(),
        planner_params_hash: planner.params_hash(),
        database: state.store().pool_stats().map(|stats| DatabaseHealth {
            connected: healthy,
            pool_size: stats.size,
            pool_idle: stats.idle,
            pool_max: stats.max,
        }),
    })
}

/// Liveness probe endpoint.
///
/// Does NOT check dependencies.
async fn liveness_handler() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "alive".to_string(),
    })
}

/// Readiness probe endpoint.
///
/// Returns 200 if the store answers, 503 otherwise.
async fn readiness_handler<S: ServiceStore>(
    State(state): State<Arc<ServiceState<S>>>,
) -> Result<Json<ReadinessResponse>, (StatusCode, Json<ReadinessResponse>)> {
    if state.store().is_healthy().await {
        Ok(Json(ReadinessResponse {
            ready: true,
            store: true,
            details: None,
        }))
    } else {
        Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                store: false,
                details: Some("Store connection failed".to_string()),
            }),
        ))
    }
}

// ============================================================================
// Router Construction
// ============================================================================

/// Create the Axum router for the Edit Plan service.
pub fn create_router<S: ServiceStore>(state: ServiceState<S>) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Jobs
        .route("/api/jobs", post(create_job_handler::<S>).get(list_jobs_handler::<S>))
        .route("/api/jobs/:id", get(get_job_handler::<S>))
        // Stage control
        .route("/api/jobs/:id/advance", post(advance_handler::<S>))
        .route("/api/jobs/:id/resume", post(resume_handler::<S>))
        .route("/api/jobs/:id/run", post(run_handler::<S>))
        .route("/api/jobs/:id/cancel", post(cancel_handler::<S>))
        // Outputs
        .route("/api/jobs/:id/checkpoints/latest", get(latest_checkpoint_handler::<S>))
        .route("/api/jobs/:id/blueprint", get(blueprint_handler::<S>))
        .route("/api/jobs/:id/progress", get(progress_handler::<S>))
        // Health checks
        .route("/health", get(health_handler::<S>))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler::<S>))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::job::{Collaborators, JobStateMachine};
    use crate::progress::BroadcastPublisher;
    use crate::store::InMemoryStore;
    use crate::DEFAULT_PLANNER_VERSION;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn router(root: &std::path::Path) -> Router {
        let progress = Arc::new(BroadcastPublisher::default());
        let machine = JobStateMachine::new(
            Arc::new(InMemoryStore::new()),
            progress.clone(),
            Collaborators::file_drop(root),
            EngineConfig::default(),
        );
        create_router(ServiceState::new(machine, progress))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_create_and_advance_job() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());

        let (status, job) = call(
            &app,
            "POST",
            "/api/jobs",
            Some(serde_json::json!({"name": "rough cut", "media_ids": ["a"]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(job["status"], "created");
        let id = job["job_id"].as_str().unwrap().to_string();

        let media = dir.path().join(&id).join("media");
        std::fs::create_dir_all(&media).unwrap();
        std::fs::write(media.join("a.mov"), b"").unwrap();

        let (status, result) = call(&app, "POST", &format!("/api/jobs/{}/advance", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["result"], "advanced");
        assert_eq!(result["stage"], "uploading");
        assert_eq!(result["next"], "annotating");

        let (status, error) = call(&app, "GET", &format!("/api/jobs/{}/blueprint", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "NO_BLUEPRINT");
    }

    #[tokio::test]
    async fn test_job_errors_map_to_status_codes() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());

        let (status, error) = call(&app, "GET", "/api/jobs/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "INVALID_JOB_ID");

        let missing = uuid::Uuid::from_u128(1);
        let (status, error) = call(&app, "POST", &format!("/api/jobs/{}/advance", missing), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["code"], "JOB_NOT_FOUND");

        let (_, job) = call(&app, "POST", "/api/jobs", Some(serde_json::json!({"name": "j"}))).await;
        let id = job["job_id"].as_str().unwrap().to_string();
        let (status, cancelled) = call(&app, "POST", &format!("/api/jobs/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["status"], "cancelled");

        let (status, error) = call(&app, "POST", &format!("/api/jobs/{}/advance", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["code"], "JOB_TERMINAL");
    }

    #[tokio::test]
    async fn test_health_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());

        let (status, health) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["schema_version"], EDIT_PLAN_SCHEMA_VERSION);
        assert_eq!(health["planner_version"], DEFAULT_PLANNER_VERSION);
        assert!(health.get("database").is_none());

        let (status, ready) = call(&app, "GET", "/health/ready", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ready["ready"], true);
    }

    #[tokio::test]
    async fn test_rejects_empty_job_name() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(dir.path());
        let (status, error) = call(&app, "POST", "/api/jobs", Some(serde_json::json!({"name": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["code"], "INVALID_SPEC");
    }
}
