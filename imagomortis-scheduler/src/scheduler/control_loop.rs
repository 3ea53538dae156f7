//! Control loop
//!
//! Claims one image at a time and hands it to the reconciler. Sleeps
//! `poll_interval` when the queue is empty and `error_delay` after a failed
//! claim. A claim failure never stops the loop.

use imagomortis_core::domain::work_item::ClaimResult;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::repository::WorkQueue;
use crate::service::Reconciler;

/// What a single iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// An item was claimed and taken to a terminal state
    Processed,
    /// Nothing was eligible
    Idle,
    /// The queue could not be read
    ClaimFailed,
}

pub struct ControlLoop {
    queue: Arc<dyn WorkQueue>,
    reconciler: Reconciler,
    poll_interval: Duration,
    error_delay: Duration,
}

impl ControlLoop {
    pub fn new(config: &Config, queue: Arc<dyn WorkQueue>, reconciler: Reconciler) -> Self {
        Self {
            queue,
            reconciler,
            poll_interval: config.poll_interval,
            error_delay: config.error_delay,
        }
    }

    /// Runs until `shutdown` is cancelled
    ///
    /// Cancellation is only observed between items, so an item that has
    /// been claimed is always processed and cleaned up first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting control loop (poll interval: {:?}, error delay: {:?})",
            self.poll_interval, self.error_delay
        );

        while !shutdown.is_cancelled() {
            let delay = match self.poll_once().await {
                PollOutcome::Processed => continue,
                PollOutcome::Idle => self.poll_interval,
                PollOutcome::ClaimFailed => self.error_delay,
            };

            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Control loop stopped");
    }

    /// Claims and processes at most one item
    pub async fn poll_once(&self) -> PollOutcome {
        match self.queue.claim().await {
            Ok(ClaimResult::Claimed(item)) => {
                self.reconciler.process(item).await;
                PollOutcome::Processed
            }
            Ok(ClaimResult::Empty) => {
                debug!("No unassigned images");
                PollOutcome::Idle
            }
            Err(e) => {
                error!("Failed to claim image: {:#}", e);
                PollOutcome::ClaimFailed
            }
        }
    }
}
