//! Job orchestrator
//!
//! Translates a claimed work item into an ephemeral Kubernetes Job:
//! - Building the single-attempt job manifest
//! - Submitting it to the platform
//! - Deleting it (and its pods) once the item is settled

use anyhow::{Context, Result};
use imagomortis_core::domain::work_item::{job_name_for, short_id};
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::service::platform::JobPlatform;

/// Static parts of every job manifest
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub namespace: String,
    pub image: String,
    pub image_pull_policy: String,
    pub container_name: String,
    pub volume_claim: String,
    pub mount_path: String,
    pub ttl_seconds: u32,
}

impl JobTemplate {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.namespace.clone(),
            image: config.task_image.clone(),
            image_pull_policy: config.image_pull_policy.clone(),
            container_name: config.container_name.clone(),
            volume_claim: config.shared_volume_claim.clone(),
            mount_path: config.job_mount_path.clone(),
            ttl_seconds: config.job_ttl_seconds,
        }
    }
}

/// What to run for one claimed item
#[derive(Debug, Clone)]
pub struct JobRequest<'a> {
    pub work_id: Uuid,
    pub job_id: Uuid,
    /// Input path as seen from inside the job
    pub input_path: &'a str,
    /// Output path as seen from inside the job
    pub output_path: &'a str,
}

/// Submits and deletes ephemeral jobs
pub struct JobOrchestrator {
    platform: Arc<dyn JobPlatform>,
    template: JobTemplate,
}

impl JobOrchestrator {
    pub fn new(platform: Arc<dyn JobPlatform>, template: JobTemplate) -> Self {
        Self { platform, template }
    }

    /// Builds the job manifest for a request
    ///
    /// The job runs exactly once: `backoffLimit: 0` and `restartPolicy: Never`
    /// so a failing worker is reported to the scheduler instead of being
    /// retried by the platform.
    pub fn manifest(&self, request: &JobRequest<'_>) -> JsonValue {
        let template = &self.template;
        let name = job_name_for(request.job_id);

        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": name,
                "namespace": template.namespace,
                "labels": {
                    "app.kubernetes.io/name": "imagetask",
                    "app.kubernetes.io/component": "worker",
                    "app.kubernetes.io/part-of": "imagomortis",
                    "app.kubernetes.io/managed-by": "scheduler",
                },
            },
            "spec": {
                "backoffLimit": 0,
                "ttlSecondsAfterFinished": template.ttl_seconds,
                "template": {
                    "metadata": {
                        "labels": {
                            "app.kubernetes.io/name": "imagetask",
                            "app.kubernetes.io/component": "worker",
                            "app.kubernetes.io/part-of": "imagomortis",
                            "imagomortis/image-id": short_id(request.work_id),
                            "imagomortis/job-id": short_id(request.job_id),
                        },
                    },
                    "spec": {
                        "restartPolicy": "Never",
                        "containers": [{
                            "name": template.container_name,
                            "image": template.image,
                            "imagePullPolicy": template.image_pull_policy,
                            "args": [
                                format!("--input-path={}", request.input_path),
                                format!("--output-path={}", request.output_path),
                            ],
                            "volumeMounts": [{
                                "name": "shared-data",
                                "mountPath": template.mount_path,
                            }],
                        }],
                        "volumes": [{
                            "name": "shared-data",
                            "persistentVolumeClaim": {
                                "claimName": template.volume_claim,
                            },
                        }],
                    },
                },
            },
        })
    }

    /// Submits the job and returns its name
    ///
    /// Errors are returned to the caller; a rejected submission is fatal for
    /// the work item.
    pub async fn submit(&self, request: &JobRequest<'_>) -> Result<String> {
        let name = job_name_for(request.job_id);
        let manifest = self.manifest(request);

        self.platform
            .create_job(&manifest)
            .await
            .with_context(|| format!("Failed to create job {}", name))?;

        info!(job_name = %name, image_id = %request.work_id, "Created Kubernetes Job");
        Ok(name)
    }

    /// Deletes the job and its pods
    ///
    /// Never fails: a missing job counts as deleted and any other error is
    /// logged without retrying.
    pub async fn delete(&self, job_name: &str) {
        match self.platform.delete_job(job_name).await {
            Ok(()) => info!(job_name = %job_name, "Deleted Kubernetes Job"),
            Err(e) if e.is_not_found() => {
                warn!(job_name = %job_name, "Job already deleted");
            }
            Err(e) => {
                error!(job_name = %job_name, "Failed to delete job: {}", e);
            }
        }
    }
}
