//! Error types for the Kubernetes client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur when talking to the Kubernetes API
#[derive(Debug, Error)]
pub enum KubeError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// API returned an error status code
    #[error("API error (status {status}): {message}")]
    ApiError {
        /// HTTP status code
        status: u16,
        /// `message` of the returned `Status` object, or the raw body
        message: String,
    },

    /// Failed to parse response
    #[error("Failed to parse response: {0}")]
    ParseError(String),

    /// Client could not be configured (token, CA bundle, URL)
    #[error("Invalid client configuration: {0}")]
    Config(String),
}

impl KubeError {
    /// Create an API error from status code and message
    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is a "not found" error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ApiError { status: 404, .. })
    }

    /// Check if the log endpoint refused because the container has not started
    ///
    /// The API answers 400 with a message such as
    /// `container "imagetask" in pod "x" is waiting to start: ContainerCreating`.
    pub fn is_container_starting(&self) -> bool {
        match self {
            Self::ApiError {
                status: 400,
                message,
            } => message.contains("ContainerCreating") || message.contains("is waiting to start"),
            _ => false,
        }
    }

    /// Check if this error is a client error (4xx status)
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::ApiError { status, .. } if *status >= 400 && *status < 500)
    }
}
