//! Completion watcher
//!
//! Polls a job until the platform reports a terminal outcome.

use imagomortis_core::domain::job::JobOutcome;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::service::platform::JobPlatform;

pub struct CompletionWatcher {
    platform: Arc<dyn JobPlatform>,
    poll_interval: Duration,
}

impl CompletionWatcher {
    pub fn new(platform: Arc<dyn JobPlatform>, poll_interval: Duration) -> Self {
        Self {
            platform,
            poll_interval,
        }
    }

    /// Waits for the job to succeed or fail
    ///
    /// There is no overall timeout. A failed status check ends the wait with
    /// `Failed`: if the platform cannot be read, the job cannot be reported
    /// as fine.
    pub async fn wait(&self, job_name: &str) -> JobOutcome {
        info!(job_name = %job_name, "Waiting for job completion");

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let job = match self.platform.get_job(job_name).await {
                Ok(job) => job,
                Err(e) => {
                    error!(job_name = %job_name, "Failed to check job status: {}", e);
                    return JobOutcome::Failed;
                }
            };

            if job.succeeded() > 0 {
                info!(job_name = %job_name, "Job completed successfully");
                return JobOutcome::Succeeded;
            }

            if job.failed() > 0 {
                warn!(job_name = %job_name, "Job failed");
                return JobOutcome::Failed;
            }

            debug!(job_name = %job_name, "Job still running");
        }
    }
}
