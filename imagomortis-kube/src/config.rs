//! Connection settings for the Kubernetes API

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{KubeError, Result};

/// Directory where the service account credentials are mounted in a pod
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Base URL served by `kubectl proxy` with default flags
pub const DEFAULT_PROXY_URL: &str = "http://127.0.0.1:8001";

/// How to reach and authenticate against the API server
#[derive(Debug, Clone)]
pub struct KubeConfig {
    /// API server base URL (e.g., "https://10.0.0.1:443")
    pub api_url: String,
    /// Bearer token sent on every request
    pub token: Option<String>,
    /// PEM bundle used to verify the API server certificate
    pub ca_pem: Option<Vec<u8>>,
    /// Timeout for non-streaming requests
    pub request_timeout: Duration,
}

impl KubeConfig {
    /// Unauthenticated access through a local proxy or a plain URL
    pub fn proxy(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            token: None,
            ca_pem: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Service account credentials of the pod this process runs in
    ///
    /// # Arguments
    /// * `host` - value of `KUBERNETES_SERVICE_HOST`
    /// * `port` - value of `KUBERNETES_SERVICE_PORT`
    /// * `account_dir` - directory holding `token` and `ca.crt`
    pub fn in_cluster(host: &str, port: &str, account_dir: &Path) -> Result<Self> {
        let token = std::fs::read_to_string(account_dir.join("token")).map_err(|e| {
            KubeError::Config(format!("Failed to read service account token: {}", e))
        })?;
        let ca_pem = std::fs::read(account_dir.join("ca.crt"))
            .map_err(|e| KubeError::Config(format!("Failed to read service account CA: {}", e)))?;

        // IPv6 service hosts must be bracketed in URLs
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        Ok(Self {
            api_url: format!("https://{}:{}", host, port),
            token: Some(token.trim().to_string()),
            ca_pem: Some(ca_pem),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// Picks the connection settings the way the scheduler is deployed
    ///
    /// An explicit URL wins. Otherwise the in-cluster service account is used
    /// when the service host is known, falling back to the `kubectl proxy`
    /// default for local development.
    pub fn infer(
        explicit_url: Option<&str>,
        service_host: Option<&str>,
        service_port: Option<&str>,
    ) -> Result<Self> {
        if let Some(url) = explicit_url {
            return Ok(Self::proxy(url));
        }

        match service_host {
            Some(host) => Self::in_cluster(
                host,
                service_port.unwrap_or("443"),
                &PathBuf::from(SERVICE_ACCOUNT_DIR),
            ),
            None => Ok(Self::proxy(DEFAULT_PROXY_URL)),
        }
    }
}
