//! Imagomortis Kubernetes Client
//!
//! A small, typed HTTP client for the parts of the Kubernetes API the
//! scheduler uses: batch/v1 jobs, pods, and container log streaming.
//!
//! # Example
//!
//! ```no_run
//! use imagomortis_kube::{KubeClient, KubeConfig};
//!
//! # async fn example() -> imagomortis_kube::Result<()> {
//! let client = KubeClient::new(KubeConfig::proxy("http://127.0.0.1:8001"))?;
//! let version = client.version().await?;
//! println!("Connected to Kubernetes {}", version.git_version);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
mod jobs;
pub mod model;
mod pods;

// Re-export commonly used types
pub use config::KubeConfig;
pub use error::{KubeError, Result};
pub use pods::{LineBuffer, LogParams, LogStream, MAX_LINE_BYTES};

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Certificate, Client};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use crate::model::{ServerVersion, Status};

/// HTTP client for the Kubernetes API server
#[derive(Debug, Clone)]
pub struct KubeClient {
    /// Base URL of the API server
    base_url: String,
    /// HTTP client instance, carrying auth headers and trust roots
    client: Client,
    /// Timeout applied to every non-streaming request
    request_timeout: Duration,
}

impl KubeClient {
    /// Create a new client from connection settings
    pub fn new(config: KubeConfig) -> Result<Self> {
        let mut builder = Client::builder().connect_timeout(Duration::from_secs(10));

        if let Some(pem) = &config.ca_pem {
            let cert = Certificate::from_pem(pem)
                .map_err(|e| KubeError::Config(format!("Invalid CA bundle: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(token) = &config.token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| KubeError::Config(format!("Invalid bearer token: {}", e)))?;
            value.set_sensitive(true);

            let mut headers = HeaderMap::new();
            headers.insert(AUTHORIZATION, value);
            builder = builder.default_headers(headers);
        }

        let client = builder
            .build()
            .map_err(|e| KubeError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(config.api_url, client, config.request_timeout))
    }

    /// Create a new client with a preconfigured HTTP client
    pub fn with_client(base_url: impl Into<String>, client: Client, request_timeout: Duration) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            request_timeout,
        }
    }

    /// Get the base URL of the API server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the server version
    ///
    /// Used at startup to verify the control endpoint is reachable.
    pub async fn version(&self) -> Result<ServerVersion> {
        let url = format!("{}/version", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.request_timeout)
            .send()
            .await?;

        self.handle_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Check the status code and deserialize the JSON body
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let response = self.check_status(response).await?;

        response
            .json()
            .await
            .map_err(|e| KubeError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Check the status code, returning the response untouched on success
    ///
    /// Error bodies are `Status` objects; their `message` is surfaced so
    /// callers can tell e.g. "container is waiting to start" apart.
    async fn check_status(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        let message = match serde_json::from_str::<Status>(&body) {
            Ok(parsed) if !parsed.message.is_empty() => parsed.message,
            _ => body,
        };

        debug!(status = status.as_u16(), "Kubernetes API request failed: {}", message);
        Err(KubeError::api_error(status.as_u16(), message))
    }
}
