//! Work item repository
//!
//! Handles all database operations on the `images` table:
//! - Claiming one unassigned item (skip-locked, safe across schedulers)
//! - Overlaying progress onto an acquired item
//! - Recording the terminal outcome

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use imagomortis_core::domain::job::{JobState, Outcome};
use imagomortis_core::domain::work_item::{ClaimResult, WorkItem};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::info;
use uuid::Uuid;

/// Durable queue of work items
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Claims one unassigned item
    ///
    /// Marks the item acquired under a fresh job id. Under concurrent callers
    /// each unassigned item is handed to exactly one of them; an item locked
    /// by another caller is skipped, not waited on. Returns
    /// `ClaimResult::Empty` when nothing is eligible; store failures are
    /// errors and leave no partial claim behind.
    async fn claim(&self) -> Result<ClaimResult>;

    /// Overlays progress onto an item still acquired under `job_id`
    ///
    /// Returns whether a row was updated. Callers treat failures as
    /// non-fatal.
    async fn update_progress(
        &self,
        id: Uuid,
        job_id: Uuid,
        progress: &JsonValue,
        payload: Option<&JsonValue>,
    ) -> Result<bool>;

    /// Records the terminal outcome of an item acquired under `job_id`
    ///
    /// On success the payload is replaced by the output. Only an item that
    /// is still acquired by `job_id` is advanced, so repeating the call is a
    /// no-op and a terminal state is never overwritten. Returns whether the
    /// row was advanced.
    async fn finalize(&self, id: Uuid, job_id: Uuid, outcome: &Outcome) -> Result<bool>;
}

/// Postgres implementation of WorkQueue
#[derive(Debug, Clone)]
pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    /// Creates a new Postgres-backed work queue
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn claim(&self) -> Result<ClaimResult> {
        // Dropping the transaction without commit rolls it back, so every
        // early return below leaves the row untouched.
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin claim transaction")?;

        // Any eligible row will do; there is no FIFO guarantee
        let row: Option<(Uuid, Option<Vec<u8>>, Option<NaiveDateTime>)> = sqlx::query_as(
            r#"
            SELECT id, data, created_at FROM images
            WHERE job IS NULL
            ORDER BY RANDOM()
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to select an unassigned image")?;

        let Some((id, data, created_at)) = row else {
            tx.rollback().await.context("Failed to release claim transaction")?;
            return Ok(ClaimResult::Empty);
        };

        let item = WorkItem {
            id,
            payload: data.unwrap_or_default(),
            created_at: created_at.map(|t| t.and_utc()),
            job: None,
        };
        let job_id = Uuid::new_v4();
        let Some(claimed) = item.into_claimed(job_id) else {
            bail!("Selected image {} is already assigned", id);
        };

        sqlx::query(
            r#"
            UPDATE images
            SET job = $1
            WHERE id = $2
            "#,
        )
        .bind(Json(JobState::acquired(job_id)))
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("Failed to mark image as acquired")?;

        tx.commit().await.context("Failed to commit claim")?;

        info!(image_id = %id, job_id = %job_id, "Acquired image for processing");

        Ok(ClaimResult::Claimed(claimed))
    }

    async fn update_progress(
        &self,
        id: Uuid,
        job_id: Uuid,
        progress: &JsonValue,
        payload: Option<&JsonValue>,
    ) -> Result<bool> {
        let mut overlay = serde_json::json!({
            "progress": progress,
            "last_progress_at": chrono::Utc::now(),
        });
        if let Some(payload) = payload {
            overlay["last_progress_payload"] = payload.clone();
        }

        let result = sqlx::query(
            r#"
            UPDATE images
            SET job = job || $3
            WHERE id = $1
              AND job->>'job_id' = $2
              AND job->>'acquired' = 'true'
            "#,
        )
        .bind(id)
        .bind(job_id.to_string())
        .bind(Json(overlay))
        .execute(&self.pool)
        .await
        .context("Failed to update image job progress")?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize(&self, id: Uuid, job_id: Uuid, outcome: &Outcome) -> Result<bool> {
        let state = Json(outcome.to_state(job_id));

        let result = match outcome {
            Outcome::Success(output) => {
                sqlx::query(
                    r#"
                    UPDATE images
                    SET data = $3, job = $4
                    WHERE id = $1
                      AND job->>'job_id' = $2
                      AND job->>'acquired' = 'true'
                    "#,
                )
                .bind(id)
                .bind(job_id.to_string())
                .bind(output.as_slice())
                .bind(state)
                .execute(&self.pool)
                .await
            }
            Outcome::Failure(_) => {
                sqlx::query(
                    r#"
                    UPDATE images
                    SET job = $3
                    WHERE id = $1
                      AND job->>'job_id' = $2
                      AND job->>'acquired' = 'true'
                    "#,
                )
                .bind(id)
                .bind(job_id.to_string())
                .bind(state)
                .execute(&self.pool)
                .await
            }
        }
        .context("Failed to update image job status")?;

        Ok(result.rows_affected() > 0)
    }
}
