//! Reconciler
//!
//! Takes one claimed item through its whole lifecycle: stage the input on the
//! shared volume, run the job, observe it, record the outcome and clean up.
//! Whatever happens on the way, the item ends in exactly one terminal state
//! (unless the store itself is unreachable) and every resource created for
//! it is released.

use anyhow::{Context, Result};
use futures::FutureExt;
use imagomortis_core::domain::job::{JobOutcome, Outcome};
use imagomortis_core::domain::work_item::ClaimedItem;
use imagomortis_kube::KubeError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::repository::WorkQueue;
use crate::service::orchestrator::{JobOrchestrator, JobRequest, JobTemplate};
use crate::service::platform::JobPlatform;
use crate::service::progress::{ProgressReporter, ProgressStreamer, StreamSettings};
use crate::service::storage::{JobFiles, SharedVolume};
use crate::service::watcher::CompletionWatcher;

const FINALIZE_ATTEMPTS: u32 = 3;

pub struct Reconciler {
    queue: Arc<dyn WorkQueue>,
    platform: Arc<dyn JobPlatform>,
    orchestrator: JobOrchestrator,
    watcher: CompletionWatcher,
    volume: SharedVolume,
    stream_settings: StreamSettings,
    stream_join_timeout: Duration,
    finalize_retry_delay: Duration,
}

impl Reconciler {
    pub fn new(config: &Config, queue: Arc<dyn WorkQueue>, platform: Arc<dyn JobPlatform>) -> Self {
        Self {
            orchestrator: JobOrchestrator::new(platform.clone(), JobTemplate::from_config(config)),
            watcher: CompletionWatcher::new(platform.clone(), config.job_poll_interval),
            volume: SharedVolume::new(config.shared_volume_path.clone(), config.job_mount_path.clone()),
            stream_settings: StreamSettings::from_config(config),
            stream_join_timeout: config.stream_join_timeout,
            finalize_retry_delay: config.error_delay,
            queue,
            platform,
        }
    }

    /// Processes a claimed item to a terminal state and returns its outcome
    pub async fn process(&self, item: ClaimedItem) -> Outcome {
        let files = self.volume.files_for(item.job_id);
        info!(
            image_id = %item.id,
            job_id = %item.job_id,
            input_bytes = item.payload.len(),
            "Processing image"
        );

        let (outcome, submitted) = match AssertUnwindSafe(self.execute(&item, &files))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                // The job may or may not exist; deleting a missing job is harmless
                error!(image_id = %item.id, job_id = %item.job_id, "Processing panicked");
                (Outcome::failure("Processing panicked"), Some(item.job_name()))
            }
        };

        match &outcome {
            Outcome::Success(output) => {
                info!(image_id = %item.id, output_bytes = output.len(), "Image processed successfully")
            }
            Outcome::Failure(reason) => {
                warn!(image_id = %item.id, "Image processing failed: {}", reason)
            }
        }

        if AssertUnwindSafe(self.finalize(&item, &outcome))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(image_id = %item.id, job_id = %item.job_id, "Recording outcome panicked");
        }
        self.cleanup(submitted.as_deref(), &files).await;

        outcome
    }

    /// Runs the job and maps whatever happens to an outcome
    ///
    /// Also returns the name of the job to delete afterwards. A submission
    /// that failed without a 4xx answer may still have created the job.
    async fn execute(&self, item: &ClaimedItem, files: &JobFiles) -> (Outcome, Option<String>) {
        if let Err(e) = self.volume.write_input(files, &item.payload).await {
            return (Outcome::failure(format!("{:#}", e)), None);
        }

        let request = JobRequest {
            work_id: item.id,
            job_id: item.job_id,
            input_path: &files.job_input,
            output_path: &files.job_output,
        };
        let job_name = match self.orchestrator.submit(&request).await {
            Ok(name) => name,
            Err(e) => {
                let rejected = e
                    .downcast_ref::<KubeError>()
                    .is_some_and(KubeError::is_client_error);
                let leftover = (!rejected).then(|| item.job_name());
                let reason = e.root_cause().to_string();
                return (Outcome::failure(format!("Failed to submit job: {}", reason)), leftover);
            }
        };

        let outcome = match self.observe(item, &job_name).await {
            JobOutcome::Succeeded => match self.collect_output(files).await {
                Ok(outcome) => outcome,
                Err(e) => Outcome::failure(format!("{:#}", e)),
            },
            JobOutcome::Failed => Outcome::failure("Job failed"),
        };

        (outcome, Some(job_name))
    }

    /// Waits for the job while streaming its progress in the background
    async fn observe(&self, item: &ClaimedItem, job_name: &str) -> JobOutcome {
        let cancel = CancellationToken::new();
        let streamer = ProgressStreamer::new(
            self.platform.clone(),
            self.stream_settings.clone(),
            ProgressReporter::new(self.queue.clone(), item.id, item.job_id),
        );
        let mut handle = tokio::spawn(streamer.run(job_name.to_string(), cancel.clone()));

        // Stops the streamer even if waiting unwinds
        let stop = cancel.drop_guard();
        let outcome = self.watcher.wait(job_name).await;
        drop(stop);

        match tokio::time::timeout(self.stream_join_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(job_name = %job_name, "Progress streamer panicked: {}", e),
            Err(_) => {
                warn!(job_name = %job_name, "Progress streamer did not stop in time, aborting");
                handle.abort();
            }
        }

        outcome
    }

    /// Enforces the worker contract: exit 0 means a complete output file
    async fn collect_output(&self, files: &JobFiles) -> Result<Outcome> {
        let output = self
            .volume
            .read_output(files)
            .await
            .context("Failed to collect job output")?;

        Ok(match output {
            None => Outcome::failure("Output file not found"),
            Some(bytes) if bytes.is_empty() => Outcome::failure("Output file is empty"),
            Some(bytes) => Outcome::Success(bytes),
        })
    }

    /// Records the outcome, retrying store errors a few times
    ///
    /// Finalize is conditional on the item still being acquired by this job,
    /// so a retry after an ambiguous failure cannot apply twice.
    async fn finalize(&self, item: &ClaimedItem, outcome: &Outcome) {
        for attempt in 1..=FINALIZE_ATTEMPTS {
            match self.queue.finalize(item.id, item.job_id, outcome).await {
                Ok(true) => return,
                Ok(false) if attempt > 1 => {
                    debug!(image_id = %item.id, job_id = %item.job_id, "Outcome already recorded by an earlier attempt");
                    return;
                }
                Ok(false) => {
                    warn!(image_id = %item.id, job_id = %item.job_id, "Image was not acquired by this job, outcome not recorded");
                    return;
                }
                Err(e) if attempt < FINALIZE_ATTEMPTS => {
                    warn!(image_id = %item.id, attempt, "Failed to record outcome, retrying: {:#}", e);
                    tokio::time::sleep(self.finalize_retry_delay).await;
                }
                Err(e) => {
                    error!(image_id = %item.id, job_id = %item.job_id, "Failed to record outcome: {:#}", e);
                }
            }
        }
    }

    async fn cleanup(&self, job_name: Option<&str>, files: &JobFiles) {
        if let Some(job_name) = job_name {
            self.orchestrator.delete(job_name).await;
        }
        self.volume.remove(files).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlatform, InMemoryWorkQueue, WorkerScript};
    use imagomortis_core::domain::job::JobState;
    use imagomortis_core::domain::work_item::ClaimResult;
    use serde_json::json;
    use std::path::Path;

    fn config(shared: &Path) -> Config {
        Config {
            shared_volume_path: shared.to_path_buf(),
            error_delay: Duration::from_millis(1),
            job_poll_interval: Duration::from_millis(5),
            pod_lookup_timeout: Duration::from_millis(50),
            container_ready_timeout: Duration::from_millis(50),
            stream_join_timeout: Duration::from_millis(200),
            ..Config::default()
        }
    }

    struct Harness {
        dir: tempfile::TempDir,
        queue: Arc<InMemoryWorkQueue>,
        platform: Arc<FakePlatform>,
        reconciler: Reconciler,
    }

    impl Harness {
        fn new(build: impl FnOnce(FakePlatform) -> FakePlatform) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = config(dir.path());
            let queue = Arc::new(InMemoryWorkQueue::new());
            let platform = Arc::new(build(FakePlatform::new(dir.path(), &config.job_mount_path)));
            let reconciler = Reconciler::new(&config, queue.clone(), platform.clone());
            Self {
                dir,
                queue,
                platform,
                reconciler,
            }
        }

        async fn claim(&self, payload: &[u8]) -> ClaimedItem {
            self.queue.insert(payload);
            match self.queue.claim().await.unwrap() {
                ClaimResult::Claimed(item) => item,
                ClaimResult::Empty => panic!("expected a claim"),
            }
        }

        fn shared_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.dir.path()).unwrap().next().is_none()
        }
    }

    fn progress_line(circles: f64) -> String {
        json!({"record": {"message": "Drew circle", "extra": {"progress": {"circles": circles}}}})
            .to_string()
    }

    #[tokio::test]
    async fn test_success_replaces_payload() {
        let h = Harness::new(|p| {
            p.with_worker(WorkerScript::Succeeds(vec![9u8; 20]))
                .with_pending_polls(2)
                .with_log_lines([progress_line(50.0), progress_line(100.0)])
        });
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::Success(vec![9u8; 20]));
        let stored = h.queue.get(id);
        assert_eq!(stored.payload, vec![9u8; 20]);
        assert!(matches!(stored.job, Some(JobState::Completed { .. })));
        assert_eq!(h.queue.progress_updates(id).len(), 2);

        assert!(h.platform.live_jobs().is_empty());
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_failed_job_keeps_payload() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Fails).with_pending_polls(1));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::failure("Job failed"));
        let stored = h.queue.get(id);
        assert_eq!(stored.payload, vec![1u8; 10]);
        match stored.job {
            Some(JobState::Failed { error, .. }) => assert_eq!(error, "Job failed"),
            other => panic!("expected failed state, got {:?}", other),
        }

        assert!(h.platform.live_jobs().is_empty());
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_success_without_output_fails() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::SucceedsWithoutOutput));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::failure("Output file not found"));
        assert_eq!(h.queue.get(id).payload, vec![1u8; 10]);
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_empty_output_fails() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Succeeds(Vec::new())));
        let item = h.claim(&[1u8; 10]).await;

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::failure("Output file is empty"));
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_rejected_submission_fails_without_job() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Rejected));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;

        let outcome = h.reconciler.process(item).await;

        match outcome {
            Outcome::Failure(reason) => assert!(reason.starts_with("Failed to submit job: ")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(matches!(h.queue.get(id).job, Some(JobState::Failed { .. })));
        assert!(h.platform.delete_calls().is_empty());
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_status_fails_and_cleans_up() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::StatusUnavailable));
        let item = h.claim(&[1u8; 10]).await;
        let name = item.job_name();

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::failure("Job failed"));
        assert_eq!(h.platform.delete_calls(), vec![name]);
        assert!(h.platform.live_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_retries_store_errors() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Succeeds(vec![2u8; 20])));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;
        h.queue.fail_next_finalizes(2);

        h.reconciler.process(item).await;

        assert!(matches!(h.queue.get(id).job, Some(JobState::Completed { .. })));
        assert_eq!(h.queue.history(id).len(), 2);
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_store_is_down() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Succeeds(vec![2u8; 20])));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;
        h.queue.fail_next_finalizes(FINALIZE_ATTEMPTS as usize);

        h.reconciler.process(item).await;

        assert!(matches!(h.queue.get(id).job, Some(JobState::Acquired(_))));
        assert!(h.platform.live_jobs().is_empty());
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_open_log_stream_does_not_block_completion() {
        let h = Harness::new(|p| {
            p.with_worker(WorkerScript::Succeeds(vec![2u8; 20]))
                .with_pending_polls(3)
                .holding_log_open()
        });
        let item = h.claim(&[1u8; 10]).await;

        let outcome = tokio::time::timeout(Duration::from_secs(2), h.reconciler.process(item))
            .await
            .expect("processing hung on the progress stream");

        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_timed_out_submission_deletes_job() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::CreatedButTimedOut));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;
        let name = item.job_name();

        let outcome = h.reconciler.process(item).await;

        match outcome {
            Outcome::Failure(reason) => assert!(reason.starts_with("Failed to submit job: ")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(matches!(h.queue.get(id).job, Some(JobState::Failed { .. })));
        assert_eq!(h.platform.created_jobs(), vec![name.clone()]);
        assert_eq!(h.platform.delete_calls(), vec![name]);
        assert!(h.platform.live_jobs().is_empty());
        assert!(h.shared_dir_is_empty());
    }

    #[tokio::test]
    async fn test_lost_finalize_ack_is_not_recorded_twice() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::Succeeds(vec![2u8; 20])));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;
        h.queue.lose_next_finalize_acks(1);

        let outcome = h.reconciler.process(item).await;

        assert!(outcome.is_success());
        let history = h.queue.history(id);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[1], JobState::Completed { .. }));
        assert_eq!(h.queue.get(id).payload, vec![2u8; 20]);
    }

    #[tokio::test]
    async fn test_panic_while_observing_still_cleans_up() {
        let h = Harness::new(|p| p.with_worker(WorkerScript::PanicsOnStatus));
        let item = h.claim(&[1u8; 10]).await;
        let id = item.id;
        let name = item.job_name();

        let outcome = h.reconciler.process(item).await;

        assert_eq!(outcome, Outcome::failure("Processing panicked"));
        let stored = h.queue.get(id);
        assert_eq!(stored.payload, vec![1u8; 10]);
        assert!(matches!(stored.job, Some(JobState::Failed { .. })));
        assert_eq!(h.platform.delete_calls(), vec![name]);
        assert!(h.platform.live_jobs().is_empty());
        assert!(h.shared_dir_is_empty());
    }
}
