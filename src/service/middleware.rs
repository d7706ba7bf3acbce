//! Service middleware for request metrics.
//!
//! ## Metrics Exposed
//!
//! - `request` - request count and latency by path pattern, method, status
//! - `stage_result` - outcome of advance, resume and run calls
//!
//! Metrics are emitted as structured log lines under `edit_plan::metrics`.

use std::sync::OnceLock;
use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use regex_lite::Regex;
use tracing::info;

use crate::job::StageResult;

/// Tracing target for metric lines.
pub const METRICS_TARGET: &str = "edit_plan::metrics";

/// Metrics middleware that records request counts and latency.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let latency = start.elapsed();
    let status = response.status().as_u16();

    info!(
        target: METRICS_TARGET,
        metric_type = "request",
        path = %path,
        method = %method,
        status = status,
        latency_ms = latency.as_millis() as u64,
        "request_metric"
    );

    response
}

/// Normalize path for metrics to avoid high cardinality.
///
/// Replaces UUIDs with an `:id` placeholder.
fn normalize_path(path: &str) -> String {
    static UUID: OnceLock<Option<Regex>> = OnceLock::new();
    let uuid = UUID.get_or_init(|| {
        Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}").ok()
    });

    match uuid {
        Some(re) => re.replace_all(path, ":id").into_owned(),
        None => path.to_string(),
    }
}

/// Record the outcome of a state machine call.
pub fn record_stage_result(operation: &str, result: &StageResult, latency_ms: u64) {
    let (outcome, stage) = match result {
        StageResult::Advanced { stage, .. } => ("advanced", Some(*stage)),
        StageResult::Completed { .. } => ("completed", None),
        StageResult::Failed { stage, .. } => ("failed", Some(*stage)),
        StageResult::Cancelled => ("cancelled", None),
    };
    info!(
        target: METRICS_TARGET,
        metric_type = "stage_result",
        operation = operation,
        outcome = outcome,
        stage = stage.map(|s| s.as_str()).unwrap_or("none"),
        latency_ms = latency_ms,
        "stage_result_metric"
    );
}
