//! In-memory fakes of the queue and platform seams

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use imagomortis_core::domain::job::{JobState, Outcome};
use imagomortis_core::domain::work_item::{ClaimResult, WorkItem};
use imagomortis_kube::model::{
    ContainerState, ContainerStatus, Job, JobStatus, ObjectMeta, Pod, PodStatus,
};
use imagomortis_kube::{KubeError, LogParams};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

use crate::repository::WorkQueue;
use crate::service::platform::{JobPlatform, LogLines};

/// How the fake worker behaves once its job is created
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Writes the given bytes to its output path and exits 0
    Succeeds(Vec<u8>),
    /// Exits 0 without writing anything
    SucceedsWithoutOutput,
    /// Exits 1
    Fails,
    /// Job status reads fail with 503
    StatusUnavailable,
    /// Job creation is refused with 422
    Rejected,
    /// The job is created but the API answers 504
    CreatedButTimedOut,
    /// Reading the job status panics
    PanicsOnStatus,
}

#[derive(Default)]
struct PlatformState {
    /// Live jobs and how many times their status was read
    jobs: HashMap<String, usize>,
    created: Vec<String>,
    deletes: Vec<String>,
    status_checks: usize,
    log_requests: Vec<LogParams>,
}

pub struct FakePlatform {
    local_root: PathBuf,
    mount_path: String,
    container: String,
    worker: WorkerScript,
    pending_polls: usize,
    log_lines: Vec<String>,
    hold_log_open: bool,
    not_ready_log_attempts: usize,
    has_pods: bool,
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    /// Fake platform whose workers see `local_root` mounted at `mount_path`
    pub fn new(local_root: impl Into<PathBuf>, mount_path: &str) -> Self {
        Self {
            local_root: local_root.into(),
            mount_path: mount_path.trim_end_matches('/').to_string(),
            container: "imagetask".to_string(),
            worker: WorkerScript::SucceedsWithoutOutput,
            pending_polls: 0,
            log_lines: Vec::new(),
            hold_log_open: false,
            not_ready_log_attempts: 0,
            has_pods: true,
            state: Mutex::new(PlatformState::default()),
        }
    }

    pub fn with_worker(mut self, script: WorkerScript) -> Self {
        self.worker = script;
        self
    }

    /// Number of status reads that report the job as still running
    pub fn with_pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn with_log_lines<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log_lines = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Keep the log stream open after the scripted lines, like a follow
    /// request on a container that never exits
    pub fn holding_log_open(mut self) -> Self {
        self.hold_log_open = true;
        self
    }

    /// Number of log requests refused with "ContainerCreating"
    pub fn with_not_ready_logs(mut self, attempts: usize) -> Self {
        self.not_ready_log_attempts = attempts;
        self
    }

    /// Jobs never get a pod
    pub fn without_pods(mut self) -> Self {
        self.has_pods = false;
        self
    }

    pub fn created_jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn live_jobs(&self) -> Vec<String> {
        self.state.lock().unwrap().jobs.keys().cloned().collect()
    }

    pub fn delete_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().deletes.clone()
    }

    pub fn status_checks(&self) -> usize {
        self.state.lock().unwrap().status_checks
    }

    pub fn log_requests(&self) -> Vec<LogParams> {
        self.state.lock().unwrap().log_requests.clone()
    }

    fn run_worker(&self, manifest: &JsonValue) {
        let WorkerScript::Succeeds(output) = &self.worker else {
            return;
        };

        let args = manifest["spec"]["template"]["spec"]["containers"][0]["args"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let output_path = args
            .iter()
            .filter_map(JsonValue::as_str)
            .find_map(|arg| arg.strip_prefix("--output-path="))
            .expect("manifest without --output-path");
        let relative = output_path
            .strip_prefix(&self.mount_path)
            .expect("output path outside the shared volume")
            .trim_start_matches('/');

        std::fs::write(self.local_root.join(relative), output).unwrap();
    }

    fn pod(&self, name: String) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name,
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                container_statuses: vec![ContainerStatus {
                    name: self.container.clone(),
                    state: Some(ContainerState {
                        running: Some(serde_json::json!({})),
                        ..Default::default()
                    }),
                }],
            }),
        }
    }
}

#[async_trait]
impl JobPlatform for FakePlatform {
    async fn create_job(&self, manifest: &JsonValue) -> imagomortis_kube::Result<()> {
        if matches!(self.worker, WorkerScript::Rejected) {
            return Err(KubeError::api_error(422, "Job.batch is invalid"));
        }

        let name = manifest["metadata"]["name"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.run_worker(manifest);

        let mut state = self.state.lock().unwrap();
        state.jobs.insert(name.clone(), 0);
        state.created.push(name);

        if matches!(self.worker, WorkerScript::CreatedButTimedOut) {
            return Err(KubeError::api_error(504, "Timeout: request did not complete"));
        }
        Ok(())
    }

    async fn get_job(&self, name: &str) -> imagomortis_kube::Result<Job> {
        let mut state = self.state.lock().unwrap();
        state.status_checks += 1;

        if !state.jobs.contains_key(name) {
            return Err(KubeError::api_error(404, format!("jobs.batch \"{}\" not found", name)));
        }
        match self.worker {
            WorkerScript::StatusUnavailable => {
                return Err(KubeError::api_error(503, "service unavailable"));
            }
            WorkerScript::PanicsOnStatus => {
                // Release the lock first so the fake stays usable
                drop(state);
                panic!("malformed job status");
            }
            _ => {}
        }

        let Some(polls) = state.jobs.get_mut(name) else {
            return Err(KubeError::api_error(404, format!("jobs.batch \"{}\" not found", name)));
        };

        *polls += 1;
        let status = if *polls <= self.pending_polls {
            JobStatus {
                active: Some(1),
                ..Default::default()
            }
        } else if matches!(self.worker, WorkerScript::Fails) {
            JobStatus {
                failed: Some(1),
                ..Default::default()
            }
        } else {
            JobStatus {
                succeeded: Some(1),
                ..Default::default()
            }
        };

        Ok(Job {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            status: Some(status),
        })
    }

    async fn delete_job(&self, name: &str) -> imagomortis_kube::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.deletes.push(name.to_string());
        match state.jobs.remove(name) {
            Some(_) => Ok(()),
            None => Err(KubeError::api_error(404, format!("jobs.batch \"{}\" not found", name))),
        }
    }

    async fn list_job_pods(&self, job_name: &str) -> imagomortis_kube::Result<Vec<Pod>> {
        let exists = self.state.lock().unwrap().jobs.contains_key(job_name);
        if !exists || !self.has_pods {
            return Ok(Vec::new());
        }
        Ok(vec![self.pod(format!("{}-pod", job_name))])
    }

    async fn get_pod(&self, name: &str) -> imagomortis_kube::Result<Pod> {
        Ok(self.pod(name.to_string()))
    }

    async fn stream_logs(
        &self,
        pod: &str,
        params: &LogParams,
    ) -> imagomortis_kube::Result<Box<dyn LogLines>> {
        let mut state = self.state.lock().unwrap();
        state.log_requests.push(params.clone());

        if state.log_requests.len() <= self.not_ready_log_attempts {
            return Err(KubeError::api_error(
                400,
                format!(
                    "container \"{}\" in pod \"{}\" is waiting to start: ContainerCreating",
                    params.container, pod
                ),
            ));
        }

        Ok(Box::new(ScriptedLog {
            lines: self.log_lines.iter().cloned().collect(),
            hold_open: self.hold_log_open,
        }))
    }
}

struct ScriptedLog {
    lines: VecDeque<String>,
    hold_open: bool,
}

#[async_trait]
impl LogLines for ScriptedLog {
    async fn next_line(&mut self) -> imagomortis_kube::Result<Option<String>> {
        match self.lines.pop_front() {
            Some(line) => Ok(Some(line)),
            None if self.hold_open => std::future::pending().await,
            None => Ok(None),
        }
    }
}

/// Work queue held in memory, with every state change recorded
#[derive(Default)]
pub struct InMemoryWorkQueue {
    state: Mutex<QueueState>,
}

#[derive(Default)]
struct QueueState {
    order: Vec<Uuid>,
    items: HashMap<Uuid, WorkItem>,
    history: HashMap<Uuid, Vec<JobState>>,
    progress: HashMap<Uuid, Vec<(JsonValue, Option<JsonValue>)>>,
    failing_claims: usize,
    failing_progress: bool,
    failing_finalizes: usize,
    lost_finalize_acks: usize,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an unassigned item
    pub fn insert(&self, payload: &[u8]) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state.order.push(id);
        state.items.insert(
            id,
            WorkItem {
                id,
                payload: payload.to_vec(),
                created_at: Some(Utc::now()),
                job: None,
            },
        );
        id
    }

    pub fn get(&self, id: Uuid) -> WorkItem {
        self.state.lock().unwrap().items[&id].clone()
    }

    /// Every state the item has been in, oldest first
    pub fn history(&self, id: Uuid) -> Vec<JobState> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Progress overlays applied to the item, oldest first
    pub fn progress_updates(&self, id: Uuid) -> Vec<(JsonValue, Option<JsonValue>)> {
        self.state
            .lock()
            .unwrap()
            .progress
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_next_claims(&self, count: usize) {
        self.state.lock().unwrap().failing_claims = count;
    }

    pub fn fail_progress(&self) {
        self.state.lock().unwrap().failing_progress = true;
    }

    pub fn fail_next_finalizes(&self, count: usize) {
        self.state.lock().unwrap().failing_finalizes = count;
    }

    /// The next `count` finalizes are applied but report a store error
    pub fn lose_next_finalize_acks(&self, count: usize) {
        self.state.lock().unwrap().lost_finalize_acks = count;
    }

    fn apply(state: &mut QueueState, id: Uuid, next: JobState) -> bool {
        let Some(item) = state.items.get_mut(&id) else {
            return false;
        };
        if !JobState::can_transition(item.job.as_ref(), &next) {
            return false;
        }
        item.job = Some(next.clone());
        state.history.entry(id).or_default().push(next);
        true
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn claim(&self) -> Result<ClaimResult> {
        let mut state = self.state.lock().unwrap();
        if state.failing_claims > 0 {
            state.failing_claims -= 1;
            bail!("connection refused");
        }

        let next = state
            .order
            .iter()
            .copied()
            .find(|id| state.items[id].is_unassigned());
        let Some(id) = next else {
            return Ok(ClaimResult::Empty);
        };

        let job_id = Uuid::new_v4();
        let Some(claimed) = state.items[&id].clone().into_claimed(job_id) else {
            bail!("item {} is already assigned", id);
        };
        Self::apply(&mut state, id, JobState::acquired(job_id));

        Ok(ClaimResult::Claimed(claimed))
    }

    async fn update_progress(
        &self,
        id: Uuid,
        job_id: Uuid,
        progress: &JsonValue,
        payload: Option<&JsonValue>,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.failing_progress {
            bail!("progress store unavailable");
        }

        let Some(JobState::Acquired(acquired)) =
            state.items.get_mut(&id).and_then(|item| item.job.as_mut())
        else {
            return Ok(false);
        };
        if acquired.job_id != job_id {
            return Ok(false);
        }

        acquired.progress = Some(progress.clone());
        acquired.last_progress_at = Some(Utc::now());
        if let Some(payload) = payload {
            acquired.last_progress_payload = Some(payload.clone());
        }

        state
            .progress
            .entry(id)
            .or_default()
            .push((progress.clone(), payload.cloned()));
        Ok(true)
    }

    async fn finalize(&self, id: Uuid, job_id: Uuid, outcome: &Outcome) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.failing_finalizes > 0 {
            state.failing_finalizes -= 1;
            bail!("connection reset");
        }

        if !Self::apply(&mut state, id, outcome.to_state(job_id)) {
            return Ok(false);
        }
        if let (Outcome::Success(output), Some(item)) = (outcome, state.items.get_mut(&id)) {
            item.payload = output.clone();
        }
        if state.lost_finalize_acks > 0 {
            state.lost_finalize_acks -= 1;
            bail!("connection reset after commit");
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_queue_is_exclusive_and_monotonic() {
        let queue = InMemoryWorkQueue::new();
        let id = queue.insert(&[1u8; 10]);

        let ClaimResult::Claimed(item) = queue.claim().await.unwrap() else {
            panic!("expected a claim");
        };
        assert_eq!(item.id, id);
        assert_eq!(queue.claim().await.unwrap(), ClaimResult::Empty);

        let other_job = Uuid::new_v4();
        assert!(!queue.finalize(id, other_job, &Outcome::failure("x")).await.unwrap());
        assert!(queue.finalize(id, item.job_id, &Outcome::Success(vec![2u8; 20])).await.unwrap());
        assert!(!queue.finalize(id, item.job_id, &Outcome::failure("late")).await.unwrap());

        let history = queue.history(id);
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], JobState::Acquired(_)));
        assert!(matches!(history[1], JobState::Completed { .. }));
        assert_eq!(queue.get(id).payload, vec![2u8; 20]);
    }
}
