//! Service state management.
//!
//! Holds the job state machine and the progress fan-out shared by every
//! request handler.

use std::sync::Arc;

use async_trait::async_trait;

use crate::job::JobStateMachine;
use crate::progress::BroadcastPublisher;
use crate::store::{CheckpointStore, InMemoryStore, JobStore, PostgresStore};
use crate::store::postgres::PoolStats;

/// Health reporting for a storage backend.
#[async_trait]
pub trait StoreHealth: Send + Sync {
    /// Whether the backend answers queries.
    async fn is_healthy(&self) -> bool;

    /// Connection pool statistics, for pooled backends.
    fn pool_stats(&self) -> Option<PoolStats> {
        None
    }
}

#[async_trait]
impl StoreHealth for PostgresStore {
    async fn is_healthy(&self) -> bool {
        PostgresStore::is_healthy(self).await
    }

    fn pool_stats(&self) -> Option<PoolStats> {
        Some(PostgresStore::pool_stats(self))
    }
}

#[async_trait]
impl StoreHealth for InMemoryStore {
    async fn is_healthy(&self) -> bool {
        true
    }
}

/// Bounds every service store satisfies.
pub trait ServiceStore: CheckpointStore + JobStore + StoreHealth + 'static {}

impl<S> ServiceStore for S where S: CheckpointStore + JobStore + StoreHealth + 'static {}

/// Shared service state.
pub struct ServiceState<S> {
    /// Drives jobs.
    pub machine: JobStateMachine<S>,
    /// Progress fan-out the machine publishes to.
    pub progress: Arc<BroadcastPublisher>,
}

impl<S: ServiceStore> ServiceState<S> {
    /// Create service state.
    ///
    /// `progress` must be the publisher `machine` was built with, or progress
    /// streams stay silent.
    pub fn new(machine: JobStateMachine<S>, progress: Arc<BroadcastPublisher>) -> Self {
        Self { machine, progress }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        self.machine.store()
    }
}

impl<S> Clone for ServiceState<S> {
    fn clone(&self) -> Self {
        Self {
            machine: self.machine.clone(),
            progress: Arc::clone(&self.progress),
        }
    }
}
