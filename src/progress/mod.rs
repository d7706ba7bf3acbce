//! Progress publication.
//!
//! Publishing is fire-and-forget: `publish` never blocks and never fails.
//! Delivery is best-effort; consumers must tolerate duplicates, gaps and
//! reordering. Transport concerns (reconnects, backoff) live in
//! [`subscriber`], never in the publisher.

pub mod subscriber;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::types::{JobId, JobStatus, ProgressBand, ProgressEvent, Stage};

pub use subscriber::{
    spawn_subscriber, ProgressConnection, ProgressSource, SubscribeError, SubscriberConfig,
    SubscriberExit, SubscriberHandle,
};

/// Tracing target for progress events.
pub const PROGRESS_TARGET: &str = "edit_plan::progress";

/// Default per-job broadcast buffer.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Sink for progress events.
pub trait ProgressPublisher: Send + Sync {
    /// Publish an event without waiting for any consumer.
    fn publish(&self, event: &ProgressEvent);

    /// Called once a job reaches a terminal status.
    fn close(&self, _job_id: JobId) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpPublisher;

impl ProgressPublisher for NoOpPublisher {
    fn publish(&self, _event: &ProgressEvent) {}
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingPublisher {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events published so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Events of one job.
    pub fn events_for(&self, job_id: JobId) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect()
    }
}

impl ProgressPublisher for RecordingPublisher {
    fn publish(&self, event: &ProgressEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Per-job fan-out over `tokio::sync::broadcast`.
///
/// Slow subscribers lag and lose events; they never slow the publisher.
#[derive(Debug)]
pub struct BroadcastPublisher {
    channels: RwLock<BTreeMap<JobId, broadcast::Sender<ProgressEvent>>>,
    capacity: usize,
}

impl BroadcastPublisher {
    /// Create a publisher with the given per-job buffer size.
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, job_id: JobId) -> broadcast::Sender<ProgressEvent> {
        if let Some(sender) = self.channels.read().get(&job_id) {
            return sender.clone();
        }
        self.channels
            .write()
            .entry(job_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Subscribe to a job's events from now on.
    pub fn subscribe(&self, job_id: JobId) -> broadcast::Receiver<ProgressEvent> {
        self.sender(job_id).subscribe()
    }

    /// Live receivers of a job's channel.
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels
            .read()
            .get(&job_id)
            .map_or(0, |sender| sender.receiver_count())
    }

    /// Number of jobs with an open channel.
    pub fn open_channels(&self) -> usize {
        self.channels.read().len()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl ProgressPublisher for BroadcastPublisher {
    fn publish(&self, event: &ProgressEvent) {
        // No receivers is not an error.
        let _ = self.sender(event.job_id).send(event.clone());
    }

    fn close(&self, job_id: JobId) {
        self.channels.write().remove(&job_id);
    }
}

/// Monotonic progress tracker for one job.
///
/// Clamps every event's percent to be at least the previous one, logs it and
/// hands it to the publisher.
#[derive(Clone)]
pub struct JobProgress {
    job_id: JobId,
    publisher: Arc<dyn ProgressPublisher>,
    last_percent: Arc<Mutex<f64>>,
}

impl std::fmt::Debug for JobProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProgress")
            .field("job_id", &self.job_id)
            .field("last_percent", &*self.last_percent.lock())
            .finish_non_exhaustive()
    }
}

impl JobProgress {
    /// Start tracking at `floor` percent.
    pub fn new(job_id: JobId, publisher: Arc<dyn ProgressPublisher>, floor: f64) -> Self {
        Self {
            job_id,
            publisher,
            last_percent: Arc::new(Mutex::new(floor.clamp(0.0, 100.0))),
        }
    }

    /// Job being tracked.
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Highest percent published so far.
    pub fn percent(&self) -> f64 {
        *self.last_percent.lock()
    }

    /// Publish one event; percent never goes backwards.
    pub fn emit(
        &self,
        stage: JobStatus,
        percent: f64,
        current_item: Option<String>,
        processed_items: u32,
        total_items: u32,
        message: impl Into<String>,
    ) -> ProgressEvent {
        let progress_percent = {
            let mut last = self.last_percent.lock();
            *last = last.max(percent.clamp(0.0, 100.0));
            *last
        };
        let event = ProgressEvent {
            job_id: self.job_id,
            stage,
            progress_percent,
            current_item,
            total_items,
            processed_items,
            message: message.into(),
        };
        tracing::info!(
            target: PROGRESS_TARGET,
            job_id = %event.job_id,
            stage = %event.stage,
            percent = event.progress_percent,
            processed = event.processed_items,
            total = event.total_items,
            "{}",
            event.message
        );
        self.publisher.publish(&event);
        event
    }

    /// Publish at the current percent (used for failure and cancellation).
    pub fn emit_status(&self, stage: JobStatus, message: impl Into<String>) -> ProgressEvent {
        let percent = self.percent();
        self.emit(stage, percent, None, 0, 0, message)
    }

    /// Scoped handle for reporting items within one stage.
    pub fn stage(&self, stage: Stage) -> StageProgress {
        StageProgress {
            progress: self.clone(),
            stage,
            band: ProgressBand::for_stage(stage),
        }
    }

    /// Signal consumers that no more events follow.
    pub fn close(&self) {
        self.publisher.close(self.job_id);
    }
}

/// Progress handle given to a running stage.
///
/// Maps item counts onto the stage's slice of the overall percent range.
#[derive(Debug, Clone)]
pub struct StageProgress {
    progress: JobProgress,
    stage: Stage,
    band: ProgressBand,
}

impl StageProgress {
    /// Stage being reported.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Report the stage starting.
    pub fn started(&self, total_items: u32, message: impl Into<String>) {
        self.progress
            .emit(self.stage.into(), self.band.start, None, 0, total_items, message);
    }

    /// Report one more item processed.
    pub fn item(
        &self,
        current_item: impl Into<String>,
        processed_items: u32,
        total_items: u32,
        message: impl Into<String>,
    ) {
        self.progress.emit(
            self.stage.into(),
            self.band.at(processed_items, total_items),
            Some(current_item.into()),
            processed_items,
            total_items,
            message,
        );
    }

    /// Report the stage complete.
    pub fn finished(&self, total_items: u32, message: impl Into<String>) {
        self.progress.emit(
            self.stage.into(),
            self.band.end,
            None,
            total_items,
            total_items,
            message,
        );
    }
}
