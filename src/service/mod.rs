//! Edit Plan REST Service
//!
//! Exposes the job state machine as a REST API.
//!
//! ## Endpoints
//!
//! - `POST /api/jobs` - Create a job
//! - `GET /api/jobs` - List jobs
//! - `GET /api/jobs/:id` - Get a job record
//! - `POST /api/jobs/:id/advance` - Run the next stage
//! - `POST /api/jobs/:id/resume` - Resume after a failure or interruption
//! - `POST /api/jobs/:id/run` - Run to completion in the background
//! - `POST /api/jobs/:id/cancel` - Request cancellation
//! - `GET /api/jobs/:id/checkpoints/latest` - Newest checkpoint
//! - `GET /api/jobs/:id/blueprint` - Planned blueprint
//! - `GET /api/jobs/:id/progress` - Server-sent progress events
//! - `GET /health` - Detailed service health check
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe

pub mod middleware;
pub mod routes;
pub mod state;

pub use middleware::{metrics_middleware, record_stage_result};
pub use routes::{create_router, AppState};
pub use state::{ServiceState, ServiceStore, StoreHealth};
