//! Job status domain types
//!
//! The `job` column of a work item holds one JSON document per lifecycle
//! stage. The listing API reads these documents directly, so the flat
//! layout (`{"acquired": true, "job_id": ...}`) is kept as the wire format
//! and mapped to the [`JobState`] enum through [`JobDocument`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

/// Lifecycle of a claimed work item
///
/// The unassigned stage is represented by the absence of a state
/// (`Option<JobState>::None`). States only move forward: acquired, then
/// exactly one of completed or failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JobDocument", into = "JobDocument")]
pub enum JobState {
    Acquired(Acquired),
    Completed {
        job_id: Uuid,
        completed_at: DateTime<Utc>,
    },
    Failed {
        job_id: Uuid,
        failed_at: DateTime<Utc>,
        error: String,
    },
}

/// A claimed item, possibly with a progress overlay
#[derive(Debug, Clone, PartialEq)]
pub struct Acquired {
    pub job_id: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: Option<JsonValue>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub last_progress_payload: Option<JsonValue>,
}

impl JobState {
    /// Freshly claimed state
    pub fn acquired(job_id: Uuid) -> Self {
        JobState::Acquired(Acquired {
            job_id,
            started_at: Some(Utc::now()),
            progress: None,
            last_progress_at: None,
            last_progress_payload: None,
        })
    }

    pub fn completed(job_id: Uuid) -> Self {
        JobState::Completed {
            job_id,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(job_id: Uuid, error: impl Into<String>) -> Self {
        JobState::Failed {
            job_id,
            failed_at: Utc::now(),
            error: error.into(),
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            JobState::Acquired(acquired) => acquired.job_id,
            JobState::Completed { job_id, .. } | JobState::Failed { job_id, .. } => *job_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Acquired(_))
    }

    /// Checks whether `next` is a legal successor of `current`
    ///
    /// Legal moves are unassigned to acquired, and acquired to a terminal
    /// state carrying the same job id. Everything else (resets, terminal to
    /// terminal, re-acquiring) is rejected.
    pub fn can_transition(current: Option<&JobState>, next: &JobState) -> bool {
        match (current, next) {
            (None, JobState::Acquired(_)) => true,
            (Some(JobState::Acquired(held)), next) if next.is_terminal() => {
                held.job_id == next.job_id()
            }
            _ => false,
        }
    }
}

/// Final result of processing a claimed item
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The worker produced a new payload
    Success(Vec<u8>),
    /// The item failed, with a human readable reason
    Failure(String),
}

impl Outcome {
    pub fn failure(message: impl Into<String>) -> Self {
        Outcome::Failure(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    /// Terminal state recorded for this outcome
    pub fn to_state(&self, job_id: Uuid) -> JobState {
        match self {
            Outcome::Success(_) => JobState::completed(job_id),
            Outcome::Failure(error) => JobState::failed(job_id, error.clone()),
        }
    }
}

/// Terminal status of an ephemeral job as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

// =============================================================================
// Wire Format
// =============================================================================

/// Flat JSON layout of the `job` column
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobDocument {
    #[serde(default, skip_serializing_if = "is_false")]
    pub acquired: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
    pub job_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress_payload: Option<JsonValue>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A `job` document that does not describe exactly one lifecycle stage
#[derive(Debug, Error)]
pub enum InvalidJobDocument {
    #[error("job document for {0} must set exactly one of acquired, completed or failed")]
    AmbiguousStage(Uuid),

    #[error("job document for {job_id} is missing {field}")]
    MissingField { job_id: Uuid, field: &'static str },
}

impl TryFrom<JobDocument> for JobState {
    type Error = InvalidJobDocument;

    fn try_from(doc: JobDocument) -> Result<Self, Self::Error> {
        let job_id = doc.job_id;
        match (doc.acquired, doc.completed, doc.failed) {
            (true, false, false) => Ok(JobState::Acquired(Acquired {
                job_id,
                started_at: doc.started_at,
                progress: doc.progress,
                last_progress_at: doc.last_progress_at,
                last_progress_payload: doc.last_progress_payload,
            })),
            (false, true, false) => Ok(JobState::Completed {
                job_id,
                completed_at: doc.completed_at.ok_or(InvalidJobDocument::MissingField {
                    job_id,
                    field: "completed_at",
                })?,
            }),
            (false, false, true) => Ok(JobState::Failed {
                job_id,
                failed_at: doc.failed_at.ok_or(InvalidJobDocument::MissingField {
                    job_id,
                    field: "failed_at",
                })?,
                error: doc.error.unwrap_or_else(|| "Unknown error".to_string()),
            }),
            _ => Err(InvalidJobDocument::AmbiguousStage(job_id)),
        }
    }
}

impl From<JobState> for JobDocument {
    fn from(state: JobState) -> Self {
        match state {
            JobState::Acquired(acquired) => JobDocument {
                acquired: true,
                job_id: acquired.job_id,
                started_at: acquired.started_at,
                progress: acquired.progress,
                last_progress_at: acquired.last_progress_at,
                last_progress_payload: acquired.last_progress_payload,
                ..Default::default()
            },
            JobState::Completed {
                job_id,
                completed_at,
            } => JobDocument {
                completed: true,
                job_id,
                completed_at: Some(completed_at),
                ..Default::default()
            },
            JobState::Failed {
                job_id,
                failed_at,
                error,
            } => JobDocument {
                failed: true,
                job_id,
                failed_at: Some(failed_at),
                error: Some(error),
                ..Default::default()
            },
        }
    }
}
