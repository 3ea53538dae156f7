//! Orchestration platform seam
//!
//! Every call the scheduler makes against Kubernetes goes through
//! [`JobPlatform`], scoped to one namespace. The production implementation
//! wraps [`KubeClient`]; tests substitute a scripted fake.

use async_trait::async_trait;
use imagomortis_kube::model::{Job, Pod};
use imagomortis_kube::{KubeClient, LogParams, LogStream, Result};
use serde_json::Value as JsonValue;

/// A container log read line by line
#[async_trait]
pub trait LogLines: Send {
    /// Next line, or `None` once the log has ended
    async fn next_line(&mut self) -> Result<Option<String>>;
}

#[async_trait]
impl LogLines for LogStream {
    async fn next_line(&mut self) -> Result<Option<String>> {
        LogStream::next_line(self).await
    }
}

/// Namespaced job, pod and log operations
#[async_trait]
pub trait JobPlatform: Send + Sync {
    /// Submits a complete `batch/v1` Job manifest
    async fn create_job(&self, manifest: &JsonValue) -> Result<()>;

    async fn get_job(&self, name: &str) -> Result<Job>;

    /// Deletes a job together with its pods
    async fn delete_job(&self, name: &str) -> Result<()>;

    /// Pods created by the named job
    async fn list_job_pods(&self, job_name: &str) -> Result<Vec<Pod>>;

    async fn get_pod(&self, name: &str) -> Result<Pod>;

    async fn stream_logs(&self, pod: &str, params: &LogParams) -> Result<Box<dyn LogLines>>;
}

/// Kubernetes implementation of JobPlatform
#[derive(Debug, Clone)]
pub struct KubePlatform {
    client: KubeClient,
    namespace: String,
}

impl KubePlatform {
    pub fn new(client: KubeClient, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl JobPlatform for KubePlatform {
    async fn create_job(&self, manifest: &JsonValue) -> Result<()> {
        self.client.create_job(&self.namespace, manifest).await?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Job> {
        self.client.get_job(&self.namespace, name).await
    }

    async fn delete_job(&self, name: &str) -> Result<()> {
        self.client.delete_job(&self.namespace, name).await
    }

    async fn list_job_pods(&self, job_name: &str) -> Result<Vec<Pod>> {
        let selector = format!("job-name={}", job_name);
        self.client.list_pods(&self.namespace, &selector).await
    }

    async fn get_pod(&self, name: &str) -> Result<Pod> {
        self.client.get_pod(&self.namespace, name).await
    }

    async fn stream_logs(&self, pod: &str, params: &LogParams) -> Result<Box<dyn LogLines>> {
        let stream = self.client.stream_logs(&self.namespace, pod, params).await?;
        Ok(Box::new(stream))
    }
}
