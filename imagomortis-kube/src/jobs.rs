//! batch/v1 Job endpoints

use serde_json::Value as JsonValue;

use crate::KubeClient;
use crate::error::Result;
use crate::model::Job;

impl KubeClient {
    fn jobs_url(&self, namespace: &str) -> String {
        format!("{}/apis/batch/v1/namespaces/{}/jobs", self.base_url, namespace)
    }

    /// Create a job from a full manifest
    ///
    /// # Arguments
    /// * `namespace` - Target namespace
    /// * `manifest` - A complete `batch/v1` `Job` object
    pub async fn create_job(&self, namespace: &str, manifest: &JsonValue) -> Result<Job> {
        let response = self
            .client
            .post(self.jobs_url(namespace))
            .timeout(self.request_timeout)
            .json(manifest)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Read a job, including its status counters
    pub async fn get_job(&self, namespace: &str, name: &str) -> Result<Job> {
        let url = format!("{}/{}", self.jobs_url(namespace), name);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Delete a job together with its pods
    ///
    /// Uses foreground propagation: the pods are removed before the job
    /// object itself. A missing job surfaces as a 404 `ApiError`; see
    /// [`crate::KubeError::is_not_found`].
    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let url = format!("{}/{}", self.jobs_url(namespace), name);
        let body = serde_json::json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Foreground",
        });

        let response = self
            .client
            .delete(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;

        self.check_status(response).await?;
        Ok(())
    }
}
