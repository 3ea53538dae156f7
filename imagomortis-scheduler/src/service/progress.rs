//! Progress streamer
//!
//! Follows the worker container's log while the job runs and forwards the
//! progress records it finds to the work queue. Everything here is best
//! effort: a missing pod, a refused log request or a broken stream stop the
//! streamer quietly and never affect the item's outcome.

use imagomortis_core::domain::progress::{LogLine, ProgressEvent};
use imagomortis_kube::LogParams;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::repository::WorkQueue;
use crate::service::platform::{JobPlatform, LogLines};

/// Timing of pod lookup, readiness wait and log attach
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub container_name: String,
    pub pod_lookup_timeout: Duration,
    pub container_ready_timeout: Duration,
    /// Sleep between pod lookups and readiness checks
    pub poll_step: Duration,
    pub tail_lines: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl StreamSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            container_name: config.container_name.clone(),
            pod_lookup_timeout: config.pod_lookup_timeout,
            container_ready_timeout: config.container_ready_timeout,
            poll_step: Duration::from_secs(1),
            tail_lines: config.log_tail_lines,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
        }
    }

    /// Attempts at opening the log while the container is still being created
    pub fn max_log_attempts(&self) -> u32 {
        let scaled = self.container_ready_timeout.as_secs() / 5;
        u32::try_from(scaled).unwrap_or(u32::MAX).max(3)
    }
}

/// Writes progress of one claimed item to the queue
///
/// Failures are logged and swallowed; a lost progress update never fails
/// the item.
#[derive(Clone)]
pub struct ProgressReporter {
    queue: Arc<dyn WorkQueue>,
    image_id: Uuid,
    job_id: Uuid,
}

impl ProgressReporter {
    pub fn new(queue: Arc<dyn WorkQueue>, image_id: Uuid, job_id: Uuid) -> Self {
        Self {
            queue,
            image_id,
            job_id,
        }
    }

    pub async fn report(&self, event: &ProgressEvent) {
        let payload = event.message.clone().map(JsonValue::String);

        match self
            .queue
            .update_progress(self.image_id, self.job_id, &event.metrics_value(), payload.as_ref())
            .await
        {
            Ok(true) => debug!(image_id = %self.image_id, progress = %event.metrics_value(), "Updated progress"),
            Ok(false) => {
                debug!(image_id = %self.image_id, job_id = %self.job_id, "Image no longer acquired by this job, progress dropped")
            }
            Err(e) => warn!(image_id = %self.image_id, "Failed to update progress: {:#}", e),
        }
    }
}

pub struct ProgressStreamer {
    platform: Arc<dyn JobPlatform>,
    settings: StreamSettings,
    reporter: ProgressReporter,
}

impl ProgressStreamer {
    pub fn new(
        platform: Arc<dyn JobPlatform>,
        settings: StreamSettings,
        reporter: ProgressReporter,
    ) -> Self {
        Self {
            platform,
            settings,
            reporter,
        }
    }

    /// Streams progress until the log ends or `cancel` fires
    pub async fn run(self, job_name: String, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(job_name = %job_name, "Progress streaming cancelled");
            }
            _ = self.stream(&job_name) => {}
        }
    }

    async fn stream(&self, job_name: &str) {
        let Some(pod) = self.find_pod(job_name).await else {
            warn!(job_name = %job_name, "No pod found for job, progress will not be reported");
            return;
        };

        if !self.wait_for_container(&pod).await {
            info!(pod = %pod, "Container not ready in time, streaming logs anyway");
        }

        let Some(mut lines) = self.open_logs(&pod).await else {
            return;
        };

        info!(pod = %pod, "Streaming progress from job logs");

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => self.handle_line(&line).await,
                Ok(None) => {
                    debug!(pod = %pod, "Log stream ended");
                    break;
                }
                Err(e) => {
                    warn!(pod = %pod, "Log stream interrupted: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_line(&self, line: &str) {
        match LogLine::parse(line) {
            LogLine::Progress(event) => self.reporter.report(&event).await,
            LogLine::Record => {}
            LogLine::Unstructured => trace!(line = %line, "Skipping non-JSON log line"),
        }
    }

    /// Looks up the job's pod, preferring one that has left Pending
    async fn find_pod(&self, job_name: &str) -> Option<String> {
        let deadline = Instant::now() + self.settings.pod_lookup_timeout;

        loop {
            match self.platform.list_job_pods(job_name).await {
                Ok(pods) => {
                    let preferred = pods
                        .iter()
                        .find(|pod| matches!(pod.phase(), "Running" | "Succeeded" | "Failed"))
                        .or_else(|| pods.first());
                    if let Some(pod) = preferred {
                        debug!(job_name = %job_name, pod = %pod.metadata.name, phase = %pod.phase(), "Found job pod");
                        return Some(pod.metadata.name.clone());
                    }
                }
                Err(e) => debug!(job_name = %job_name, "Failed to list job pods: {}", e),
            }

            if Instant::now() + self.settings.poll_step > deadline {
                return None;
            }
            tokio::time::sleep(self.settings.poll_step).await;
        }
    }

    /// Waits until the worker container runs or has terminated
    async fn wait_for_container(&self, pod_name: &str) -> bool {
        let deadline = Instant::now() + self.settings.container_ready_timeout;

        loop {
            match self.platform.get_pod(pod_name).await {
                Ok(pod) => match pod.container_status(&self.settings.container_name) {
                    Some(status) if status.has_started() => return true,
                    Some(status) => {
                        debug!(pod = %pod_name, reason = ?status.waiting_reason(), "Container waiting")
                    }
                    None => debug!(pod = %pod_name, phase = %pod.phase(), "Container status not reported yet"),
                },
                Err(e) => debug!(pod = %pod_name, "Failed to read pod: {}", e),
            }

            if Instant::now() + self.settings.poll_step > deadline {
                return false;
            }
            tokio::time::sleep(self.settings.poll_step).await;
        }
    }

    async fn open_logs(&self, pod_name: &str) -> Option<Box<dyn LogLines>> {
        let params = LogParams {
            container: self.settings.container_name.clone(),
            follow: true,
            tail_lines: Some(self.settings.tail_lines),
        };
        let attempts = self.settings.max_log_attempts();
        let mut backoff = self.settings.initial_backoff;

        for attempt in 1..=attempts {
            match self.platform.stream_logs(pod_name, &params).await {
                Ok(lines) => return Some(lines),
                Err(e) if e.is_container_starting() && attempt < attempts => {
                    debug!(pod = %pod_name, attempt, "Container still starting, retrying log stream in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.max_backoff);
                }
                Err(e) => {
                    warn!(pod = %pod_name, "Failed to stream logs: {}", e);
                    return None;
                }
            }
        }

        None
    }
}
