//! Work item domain types

use uuid::Uuid;

use crate::domain::job::JobState;

/// A single image tracked by the work queue
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: Uuid,
    pub payload: Vec<u8>,
    /// Set by the producer; older rows may lack it
    pub created_at: Option<chrono::DateTime<chrono::Utc>>,
    /// `None` while the item is unassigned
    pub job: Option<JobState>,
}

impl WorkItem {
    /// Returns true if no scheduler has claimed this item yet
    pub fn is_unassigned(&self) -> bool {
        self.job.is_none()
    }

    /// Hands an unassigned item to the job that will process it
    ///
    /// Returns `None` if the item is already held by some job.
    pub fn into_claimed(self, job_id: Uuid) -> Option<ClaimedItem> {
        if !self.is_unassigned() {
            return None;
        }
        Some(ClaimedItem {
            id: self.id,
            payload: self.payload,
            job_id,
        })
    }
}

/// Result of a claim attempt against the work queue
///
/// "No work" is a normal result, distinct from a store error which is
/// reported through the surrounding `Result`.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimResult {
    Empty,
    Claimed(ClaimedItem),
}

/// An item that this scheduler instance now exclusively owns
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedItem {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub job_id: Uuid,
}

impl ClaimedItem {
    /// Name of the ephemeral job that processes this item
    pub fn job_name(&self) -> String {
        job_name_for(self.job_id)
    }
}

/// Derives the ephemeral job name from a job id
///
/// Only the first 8 characters are used so the name fits the platform's
/// length limits for names and label values.
pub fn job_name_for(job_id: Uuid) -> String {
    format!("imagetask-{}", short_id(job_id))
}

/// First 8 characters of the hyphenated form of an id
pub fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
