use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

/// Main error type for the shoal load balancer
#[derive(Error, Debug, Clone)]
pub enum ShoalError {
    /// Instance record rejected at registration
    #[error("Invalid instance: {message}")]
    InvalidInstance { message: String },

    /// Service bucket is full
    #[error("Capacity reached for service {service}: max {max} instances")]
    Capacity { service: String, max: usize },

    /// No instances registered for the service
    #[error("No servers for service {service}")]
    NoServers { service: String },

    /// Instances exist but none are healthy
    #[error("No healthy servers for service {service}")]
    NoHealthy { service: String },

    /// Backend refused, timed out or answered with a server error
    #[error("Backend unavailable: {message}")]
    BackendUnavailable { message: String },

    /// Circuit breaker is open for the instance
    #[error("Circuit breaker open for {name}")]
    BreakerOpen { name: String },

    /// Retry budget exhausted without a successful attempt
    #[error("Retries exhausted after {attempts} attempts: {message}")]
    RetryExhausted { attempts: u32, message: String },

    /// Session cache lookup failed
    #[error("Session lookup error: {message}")]
    SessionLookup { message: String },

    /// Configuration rejected at load or reload
    #[error("Configuration error: {message}")]
    ConfigInvalid { message: String },

    /// Network related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Timeout errors
    #[error("Operation timed out after {duration:?}: {operation}")]
    Timeout {
        duration: Duration,
        operation: String,
    },

    /// IO related errors
    #[error("IO error: {message}")]
    Io { message: String },

    /// Internal server errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ShoalError {
    pub fn invalid_instance<S: Into<String>>(message: S) -> Self {
        Self::InvalidInstance {
            message: message.into(),
        }
    }

    pub fn capacity<S: Into<String>>(service: S, max: usize) -> Self {
        Self::Capacity {
            service: service.into(),
            max,
        }
    }

    pub fn no_servers<S: Into<String>>(service: S) -> Self {
        Self::NoServers {
            service: service.into(),
        }
    }

    pub fn no_healthy<S: Into<String>>(service: S) -> Self {
        Self::NoHealthy {
            service: service.into(),
        }
    }

    pub fn backend_unavailable<S: Into<String>>(message: S) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
        }
    }

    pub fn breaker_open<S: Into<String>>(name: S) -> Self {
        Self::BreakerOpen { name: name.into() }
    }

    pub fn retry_exhausted<S: Into<String>>(attempts: u32, message: S) -> Self {
        Self::RetryExhausted {
            attempts,
            message: message.into(),
        }
    }

    pub fn session_lookup<S: Into<String>>(message: S) -> Self {
        Self::SessionLookup {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(duration: Duration, operation: S) -> Self {
        Self::Timeout {
            duration,
            operation: operation.into(),
        }
    }

    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShoalError::Network { .. }
                | ShoalError::Timeout { .. }
                | ShoalError::BackendUnavailable { .. }
                | ShoalError::BreakerOpen { .. }
        )
    }

    /// Check if the error should count against the circuit breaker
    pub fn should_trip_breaker(&self) -> bool {
        matches!(
            self,
            ShoalError::Network { .. }
                | ShoalError::Timeout { .. }
                | ShoalError::BackendUnavailable { .. }
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ShoalError::InvalidInstance { .. } | ShoalError::SessionLookup { .. } => {
                ErrorKind::Client
            }
            ShoalError::NoServers { .. }
            | ShoalError::NoHealthy { .. }
            | ShoalError::BackendUnavailable { .. }
            | ShoalError::BreakerOpen { .. }
            | ShoalError::RetryExhausted { .. }
            | ShoalError::Network { .. }
            | ShoalError::Timeout { .. } => ErrorKind::Backend,
            ShoalError::ConfigInvalid { .. } => ErrorKind::Config,
            ShoalError::Capacity { .. } | ShoalError::Io { .. } | ShoalError::Internal { .. } => {
                ErrorKind::Internal
            }
        }
    }
}

/// Coarse error classification used in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Client,
    Backend,
    Config,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Client => write!(f, "CLIENT"),
            ErrorKind::Backend => write!(f, "BACKEND"),
            ErrorKind::Config => write!(f, "CONFIG"),
            ErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

/// Result type alias for shoal operations
pub type ShoalResult<T> = Result<T, ShoalError>;

impl From<hyper::Error> for ShoalError {
    fn from(err: hyper::Error) -> Self {
        if err.is_timeout() {
            ShoalError::timeout(Duration::from_secs(30), "HTTP request")
        } else if err.is_connect() {
            ShoalError::network(format!("Connection error: {}", err))
        } else {
            ShoalError::network(format!("HTTP error: {}", err))
        }
    }
}

impl From<hyper::http::Error> for ShoalError {
    fn from(err: hyper::http::Error) -> Self {
        ShoalError::network(format!("HTTP error: {}", err))
    }
}

impl From<hyper::http::uri::InvalidUri> for ShoalError {
    fn from(err: hyper::http::uri::InvalidUri) -> Self {
        ShoalError::config(format!("Invalid URI: {}", err))
    }
}

impl From<std::io::Error> for ShoalError {
    fn from(err: std::io::Error) -> Self {
        ShoalError::io(format!("IO error: {}", err))
    }
}

impl From<toml::de::Error> for ShoalError {
    fn from(err: toml::de::Error) -> Self {
        ShoalError::config(format!("TOML parsing error: {}", err))
    }
}

impl From<notify::Error> for ShoalError {
    fn from(err: notify::Error) -> Self {
        ShoalError::io(format!("File watching error: {}", err))
    }
}

impl From<serde_json::Error> for ShoalError {
    fn from(err: serde_json::Error) -> Self {
        ShoalError::internal(format!("JSON serialization error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for ShoalError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ShoalError::timeout(Duration::from_secs(30), "operation")
    }
}
