//! Kubernetes object types
//!
//! Only the fields the scheduler reads are modelled; unknown fields are
//! ignored on deserialization.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Generic `*List` response (`PodList`, `JobList`, ...)
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

// =============================================================================
// Jobs
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Job {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatus {
    #[serde(default)]
    pub active: Option<i32>,
    #[serde(default)]
    pub succeeded: Option<i32>,
    #[serde(default)]
    pub failed: Option<i32>,
}

impl Job {
    /// Number of pods that finished successfully
    pub fn succeeded(&self) -> i32 {
        self.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0)
    }

    /// Number of pods that finished with a failure
    pub fn failed(&self) -> i32 {
        self.status.as_ref().and_then(|s| s.failed).unwrap_or(0)
    }
}

// =============================================================================
// Pods
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<PodStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    #[serde(default)]
    pub state: Option<ContainerState>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerState {
    #[serde(default)]
    pub running: Option<serde_json::Value>,
    #[serde(default)]
    pub terminated: Option<serde_json::Value>,
    #[serde(default)]
    pub waiting: Option<ContainerStateWaiting>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerStateWaiting {
    #[serde(default)]
    pub reason: Option<String>,
}

impl Pod {
    /// Pod phase as reported by the kubelet ("Pending", "Running", ...)
    pub fn phase(&self) -> &str {
        self.status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("")
    }

    /// Status of the named container, if the kubelet reported one
    pub fn container_status(&self, container: &str) -> Option<&ContainerStatus> {
        self.status
            .as_ref()?
            .container_statuses
            .iter()
            .find(|status| status.name == container)
    }
}

impl ContainerStatus {
    /// Logs can be read once the container runs or has terminated
    pub fn has_started(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|state| state.running.is_some() || state.terminated.is_some())
    }

    pub fn waiting_reason(&self) -> Option<&str> {
        self.state
            .as_ref()?
            .waiting
            .as_ref()?
            .reason
            .as_deref()
    }
}

/// `GET /version` response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerVersion {
    #[serde(default)]
    pub git_version: String,
    #[serde(default)]
    pub platform: String,
}

/// `Status` object returned by the API server on errors
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Status {
    #[serde(default)]
    pub message: String,
}
