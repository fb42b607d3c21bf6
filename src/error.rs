/// Unified error handling for the failover router
///
/// Every fallible operation in the crate returns a `RouterError`. Connection
/// level failures carry the endpoint they happened on so the router can
/// exclude it on retry; everything else is terminal for the current call.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::config::ConfigError;
use crate::core::Endpoint;

/// Main error type for router operations
#[derive(Debug, Error)]
pub enum RouterError {
    /// No endpoints configured or remaining
    #[error("Endpoint set is empty")]
    EmptySet,

    /// Transport could not establish a session to the chosen endpoint
    #[error("Failed to connect to {endpoint}: {reason}")]
    ConnectFailure { endpoint: Endpoint, reason: String },

    /// An established session failed while sending or receiving
    #[error("Transport error on {endpoint}: {message}")]
    Transport { endpoint: Endpoint, message: String },

    /// Every attempt allowed for this call failed
    #[error("No reachable endpoint (attempted: {})", format_attempted(.attempted))]
    Unreachable { attempted: Vec<Endpoint> },

    /// Caller deadline or transport timeout
    #[error("Operation timed out after {after:?}: {operation}")]
    Timeout { operation: String, after: Duration },

    /// Endpoint string that could not be parsed
    #[error("Invalid endpoint '{input}': {reason}")]
    InvalidEndpoint { input: String, reason: String },

    /// Malformed request or response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Instance manager or simulated cluster failure
    #[error("Orchestration error: {message}")]
    Orchestration { message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] io::Error),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_attempted(attempted: &[Endpoint]) -> String {
    if attempted.is_empty() {
        return "none".to_string();
    }
    attempted
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type alias for router operations
pub type RouterResult<T> = Result<T, RouterError>;

impl RouterError {
    /// Create a connect failure
    pub fn connect_failure<S: Into<String>>(endpoint: &Endpoint, reason: S) -> Self {
        RouterError::ConnectFailure {
            endpoint: endpoint.clone(),
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(endpoint: &Endpoint, message: S) -> Self {
        RouterError::Transport {
            endpoint: endpoint.clone(),
            message: message.into(),
        }
    }

    pub fn invalid_endpoint<S: Into<String>, R: Into<String>>(input: S, reason: R) -> Self {
        RouterError::InvalidEndpoint {
            input: input.into(),
            reason: reason.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        RouterError::Protocol(message.into())
    }

    pub fn orchestration<S: Into<String>>(message: S) -> Self {
        RouterError::Orchestration {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, after: Duration) -> Self {
        RouterError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        RouterError::Internal {
            message: message.into(),
        }
    }

    /// Connection-level failure that the router may retry on another endpoint
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            RouterError::ConnectFailure { .. } | RouterError::Transport { .. }
        )
    }

    /// Endpoint a connection-level failure happened on
    pub fn failed_endpoint(&self) -> Option<&Endpoint> {
        match self {
            RouterError::ConnectFailure { endpoint, .. } => Some(endpoint),
            RouterError::Transport { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }

    /// Check if this error is recoverable (the caller can retry the call)
    pub fn is_recoverable(&self) -> bool {
        match self {
            RouterError::Network(_) => true,
            RouterError::ConnectFailure { .. } => true,
            RouterError::Transport { .. } => true,
            RouterError::Unreachable { .. } => true,
            RouterError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RouterError::Config(_) => ErrorSeverity::Critical,
            RouterError::Internal { .. } => ErrorSeverity::Critical,
            RouterError::EmptySet => ErrorSeverity::Critical,
            RouterError::Network(_) => ErrorSeverity::Warning,
            RouterError::ConnectFailure { .. } => ErrorSeverity::Warning,
            RouterError::Transport { .. } => ErrorSeverity::Warning,
            RouterError::Timeout { .. } => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
