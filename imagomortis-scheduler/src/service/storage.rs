//! Shared volume
//!
//! The scheduler and every job mount the same volume at different paths.
//! Files are named after the job id, so concurrently processed items never
//! collide.

use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, warn};
use uuid::Uuid;

/// Input and output files of one job, in both views of the volume
#[derive(Debug, Clone, PartialEq)]
pub struct JobFiles {
    /// Input file as seen by the scheduler
    pub input: PathBuf,
    /// Output file as seen by the scheduler
    pub output: PathBuf,
    /// Input file as seen by the job
    pub job_input: String,
    /// Output file as seen by the job
    pub job_output: String,
}

#[derive(Debug, Clone)]
pub struct SharedVolume {
    local_root: PathBuf,
    job_root: String,
}

impl SharedVolume {
    /// # Arguments
    /// * `local_root` - Mount path inside the scheduler
    /// * `job_root` - Mount path inside each job
    pub fn new(local_root: impl Into<PathBuf>, job_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            job_root: job_root.into().trim_end_matches('/').to_string(),
        }
    }

    /// Creates the local mount directory if it is missing
    pub async fn ensure_exists(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.local_root)
            .await
            .with_context(|| format!("Failed to create shared volume path {}", self.local_root.display()))
    }

    pub fn files_for(&self, job_id: Uuid) -> JobFiles {
        let input_name = format!("{}-input.jpg", job_id);
        let output_name = format!("{}-output.jpg", job_id);

        JobFiles {
            input: self.local_root.join(&input_name),
            output: self.local_root.join(&output_name),
            job_input: format!("{}/{}", self.job_root, input_name),
            job_output: format!("{}/{}", self.job_root, output_name),
        }
    }

    pub async fn write_input(&self, files: &JobFiles, payload: &[u8]) -> Result<()> {
        self.ensure_exists().await?;
        tokio::fs::write(&files.input, payload)
            .await
            .with_context(|| format!("Failed to write input file {}", files.input.display()))?;

        debug!(path = %files.input.display(), bytes = payload.len(), "Wrote input image to shared volume");
        Ok(())
    }

    /// Reads the job's output, `None` if the job never wrote one
    pub async fn read_output(&self, files: &JobFiles) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(&files.output).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read output file {}", files.output.display())),
        }
    }

    /// Removes both files; missing files are fine, other errors are logged
    pub async fn remove(&self, files: &JobFiles) {
        for path in [&files.input, &files.output] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed temp file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "Failed to cleanup temp file: {}", e),
            }
        }
    }
}
