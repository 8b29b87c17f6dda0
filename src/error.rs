/// Hybrid worker error types and handling utilities
use std::path::PathBuf;

/// Errors raised at the dispatch-service boundary.
///
/// The variants are closed on purpose: callers match `Authorization`
/// explicitly because the service uses it to close a sandbox.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// The service rejected our credentials (HTTP 401)
    #[error("authorization error for {url}: status {status}")]
    Authorization { url: String, status: u16 },
    /// The service answered with something other than 200
    #[error("invalid return code for {url}: {status}")]
    InvalidStatus { url: String, status: u16 },
    /// The request never produced a response
    #[error("request error for {url} (attempt {attempt}): {reason}")]
    Request {
        url: String,
        reason: String,
        attempt: u32,
    },
    /// The response body could not be decoded
    #[error("failed to decode response from {url}: {reason}")]
    Decode { url: String, reason: String },
}

impl ServiceError {
    pub fn is_authorization(&self) -> bool {
        matches!(self, ServiceError::Authorization { .. })
    }
}

/// Main error type for worker, sandbox and job operations
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    /// Runbook definition kind has no registered interpreter
    #[error("unsupported language: definition kind {kind}")]
    UnsupportedLanguage { kind: i32 },
    /// Interpreter binary could not be invoked on this host
    #[error("interpreter `{command}` is not available on this host")]
    InterpreterUnavailable { command: String },
    #[error("I/O error during {operation} at {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("sandbox {id} is still running")]
    SandboxRunning { id: String },
    #[error("invalid job status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("configuration error: {reason}")]
    Config { reason: String },
    /// Wrapped anyhow error for compatibility
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub(crate) fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WorkerError::Io {
            operation,
            path: path.into(),
            source,
        }
    }
}

/// Helper to determine if a service error is worth another attempt
pub fn is_retryable(err: &ServiceError) -> bool {
    match err {
        ServiceError::Request { .. } => true,
        ServiceError::InvalidStatus { status, .. } => *status >= 500,
        ServiceError::Authorization { .. } => false,
        ServiceError::Decode { .. } => false,
    }
}

/// Retry configuration for dispatch-service requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Calculates exponential backoff with jitter
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let backoff = (config.initial_backoff_ms as f64
        * config.backoff_multiplier.powi(attempt as i32))
    .min(config.max_backoff_ms as f64) as u64;

    // ±20% jitter
    let jitter = (backoff as f64) * (rand::random::<f64>() * 0.4 - 0.2);
    ((backoff as f64) + jitter).max(0.0) as u64
}
