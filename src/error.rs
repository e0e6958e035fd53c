//! Error types for the modelgate gateway

use std::io;
use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration file could not be read (missing base file, unreadable overlay)
    #[error("Configuration error: {0}")]
    ConfigLoad(String),

    /// Configuration file parsing errors
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No provider matched the request path
    #[error("No provider configured for path: {0}")]
    RouteNotFound(String),

    /// Transport failure while talking to an upstream provider
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Transport failure while talking to the token endpoint
    #[error("Token exchange error: {0}")]
    TokenExchange(String),

    /// The inbound request was aborted while suspended
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ConfigParse(err.to_string())
    }
}

impl From<notify::Error> for GatewayError {
    fn from(err: notify::Error) -> Self {
        GatewayError::ConfigLoad(format!("File watcher error: {}", err))
    }
}

/// Error response that can be converted to HTTP response
#[derive(Debug, Clone)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl From<&GatewayError> for ErrorResponse {
    fn from(err: &GatewayError) -> Self {
        match err {
            GatewayError::RouteNotFound(path) => ErrorResponse {
                status: 404,
                message: format!("No provider configured for path {}", path),
            },
            GatewayError::Upstream(_) => ErrorResponse {
                status: 502,
                message: "Bad Gateway".to_string(),
            },
            GatewayError::Cancelled => ErrorResponse {
                status: 503,
                message: "Request cancelled".to_string(),
            },
            GatewayError::InvalidRequest(msg) => ErrorResponse {
                status: 400,
                message: msg.clone(),
            },
            _ => ErrorResponse {
                status: 500,
                message: "Internal Server Error".to_string(),
            },
        }
    }
}
