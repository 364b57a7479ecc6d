//! Error types for the orphan monitor
//!
//! Provides structured error types for the gateways, the scan orchestrator
//! and configuration loading, plus the classification used by the retry
//! wrapper and sub-check logging.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the monitor
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    // =========================================================================
    // Storage Backend Errors
    // =========================================================================
    #[error("Backend connection error: {0}")]
    BackendConnection(#[from] reqwest::Error),

    #[error("Backend API error ({status}): {message}")]
    BackendApi { status: u16, message: String },

    #[error("Backend response parse error: {0}")]
    BackendResponseParse(String),

    // =========================================================================
    // Permission Errors
    // =========================================================================
    #[error("Not authorized on {system}: missing permission to {permission}")]
    Unauthorized { system: String, permission: String },

    // =========================================================================
    // Scan Lifecycle Errors
    // =========================================================================
    #[error("Operation {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Operation {operation} cancelled")]
    Cancelled { operation: String },

    #[error("Scan orchestrator is stopped")]
    Stopped,

    /// An upstream failure observed by more than one sub-check
    #[error(transparent)]
    Shared(Arc<Error>),

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Duration parse error: {0}")]
    DurationParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an error, used to choose between retrying,
/// logging with remediation, or giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network blips, upstream 5xx, throttling, attempt timeouts
    Transient,
    /// Missing credentials or RBAC permission
    Permission,
    /// The addressed object does not exist
    NotFound,
    /// Bad configuration or unparseable data
    Invalid,
    /// Cancellation or a stopped orchestrator
    Shutdown,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Kube(err) => classify_kube(err),
            Error::BackendConnection(err) => {
                if err.is_decode() || err.is_builder() {
                    ErrorClass::Invalid
                } else {
                    ErrorClass::Transient
                }
            }
            Error::BackendApi { status, .. } => classify_status(*status),
            Error::Timeout { .. } => ErrorClass::Transient,

            Error::Unauthorized { .. } => ErrorClass::Permission,
            Error::ResourceNotFound { .. } => ErrorClass::NotFound,

            Error::Configuration(_)
            | Error::DurationParse(_)
            | Error::BackendResponseParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorClass::Invalid,

            Error::Cancelled { .. } | Error::Stopped => ErrorClass::Shutdown,
            Error::Shared(inner) => inner.class(),

            Error::Internal(_) | Error::Metrics(_) | Error::Io(_) => ErrorClass::Internal,
        }
    }

    /// Check if this error is transient and worth another attempt
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }

    /// Check if this error reports a missing permission
    pub fn is_permission(&self) -> bool {
        self.class() == ErrorClass::Permission
    }
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Permission,
        404 => ErrorClass::NotFound,
        408 | 429 => ErrorClass::Transient,
        s if s >= 500 => ErrorClass::Transient,
        _ => ErrorClass::Invalid,
    }
}

fn classify_kube(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code),
        kube::Error::SerdeError(_) => ErrorClass::Invalid,
        // Transport, TLS and hyper level failures
        _ => ErrorClass::Transient,
    }
}

/// Result type alias for the monitor
pub type Result<T> = std::result::Result<T, Error>;
