//! Reconnecting progress subscriber.
//!
//! A subscriber is a cancellable background task: it connects to a
//! [`ProgressSource`], forwards events to a handler and, when the connection
//! drops or cannot be made, retries with a doubling delay up to a bounded
//! number of consecutive attempts. Events published while disconnected are
//! not replayed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::types::{JobId, ProgressEvent};
use super::BroadcastPublisher;

/// Error type for connecting to a progress source.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscribeError {
    /// The source could not be reached.
    #[error("Progress source unavailable: {0}")]
    Unavailable(String),
    /// The source does not know the job.
    #[error("Unknown job: {0}")]
    UnknownJob(JobId),
}

/// An open stream of progress events.
#[async_trait]
pub trait ProgressConnection: Send {
    /// Next event, or `None` once the connection is gone.
    async fn next_event(&mut self) -> Option<ProgressEvent>;
}

#[async_trait]
impl ProgressConnection for broadcast::Receiver<ProgressEvent> {
    async fn next_event(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Something a subscriber can (re)connect to.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    /// Open a stream of a job's events.
    async fn connect(&self, job_id: JobId) -> Result<Box<dyn ProgressConnection>, SubscribeError>;
}

#[async_trait]
impl ProgressSource for BroadcastPublisher {
    async fn connect(&self, job_id: JobId) -> Result<Box<dyn ProgressConnection>, SubscribeError> {
        Ok(Box::new(self.subscribe(job_id)))
    }
}

/// Reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriberConfig {
    /// Delay before the first reconnect.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

/// Why a subscriber task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberExit {
    /// Cancelled by its owner.
    Cancelled,
    /// A terminal event was delivered.
    Finished,
    /// Reconnect attempts ran out.
    GaveUp {
        /// Attempts made.
        attempts: u32,
    },
}

/// Owner's handle on a subscriber task.
///
/// Dropping the handle cancels the subscriber.
#[derive(Debug)]
pub struct SubscriberHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<SubscriberExit>,
}

impl SubscriberHandle {
    /// Stop the subscriber and wait for it to exit.
    pub async fn cancel(mut self) -> SubscriberExit {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.join().await
    }

    /// Wait for the subscriber to exit on its own.
    pub async fn join(self) -> SubscriberExit {
        // The cancel sender must outlive the wait; dropping it cancels.
        let SubscriberHandle { cancel, task } = self;
        let exit = task.await.unwrap_or(SubscriberExit::Cancelled);
        drop(cancel);
        exit
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn a subscriber for one job.
///
/// `handler` sees every delivered event, including duplicates a source may
/// resend after a reconnect. The task ends after a terminal event, on
/// cancellation, or once `max_attempts` consecutive reconnects fail.
pub fn spawn_subscriber<S, F>(
    source: Arc<S>,
    job_id: JobId,
    config: SubscriberConfig,
    mut handler: F,
) -> SubscriberHandle
where
    S: ProgressSource + ?Sized + 'static,
    F: FnMut(ProgressEvent) + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let mut attempts = 0u32;
        let mut delay = config.initial_delay;

        loop {
            let connected = tokio::select! {
                _ = &mut cancel_rx => return SubscriberExit::Cancelled,
                connected = source.connect(job_id) => connected,
            };

            match connected {
                Ok(mut connection) => {
                    attempts = 0;
                    delay = config.initial_delay;
                    loop {
                        let next = tokio::select! {
                            _ = &mut cancel_rx => return SubscriberExit::Cancelled,
                            next = connection.next_event() => next,
                        };
                        match next {
                            Some(event) => {
                                let terminal = event.stage.is_terminal();
                                handler(event);
                                if terminal {
                                    return SubscriberExit::Finished;
                                }
                            }
                            None => break,
                        }
                    }
                    tracing::debug!(job_id = %job_id, "Progress connection closed");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Progress connect failed");
                }
            }

            attempts += 1;
            if attempts >= config.max_attempts {
                tracing::warn!(job_id = %job_id, attempts, "Progress subscriber giving up");
                return SubscriberExit::GaveUp { attempts };
            }

            tokio::select! {
                _ = &mut cancel_rx => return SubscriberExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(config.max_delay);
        }
    });

    SubscriberHandle {
        cancel: Some(cancel_tx),
        task,
    }
}
