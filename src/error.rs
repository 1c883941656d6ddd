//! Error types for the extension
//!
//! A single top-level [`ExtensionError`] is returned by every component. The
//! configuration, broker, and lifecycle concerns each have a structured
//! sub-domain so callers can match on the failure without parsing strings.

use thiserror::Error;

/// Result type alias for extension operations
pub type Result<T> = std::result::Result<T, ExtensionError>;

/// Structured configuration error domain
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    #[error("{setting}: {reason}")]
    InvalidSetting { setting: String, reason: String },
    #[error("missing {0}")]
    Missing(String),
}

impl ConfigError {
    pub fn invalid_setting(setting: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            setting: setting.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(setting: impl Into<String>) -> Self {
        Self::Missing(setting.into())
    }
}

/// Structured embedded-broker error domain
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("bind failed on {address}: {reason}")]
    BindFailed { address: String, reason: String },
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("{task}: {detail}")]
    TaskFailed { task: String, detail: String },
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
}

impl BrokerError {
    pub fn bind_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BindFailed {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn connection(detail: impl Into<String>) -> Self {
        Self::ConnectionError(detail.into())
    }

    pub fn task_failed(task: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::TaskFailed {
            task: task.into(),
            detail: detail.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Structured lifecycle API error domain
#[derive(Debug, Error, Clone)]
pub enum LifecycleError {
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("missing {0} header")]
    MissingHeader(String),
    #[error("malformed {operation} response: {detail}")]
    Malformed { operation: String, detail: String },
    #[error("{operation}: {detail}")]
    Operation { operation: String, detail: String },
}

impl LifecycleError {
    pub fn status(operation: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self::Status {
            operation: operation.into(),
            status,
            body: body.into(),
        }
    }

    pub fn missing_header(header: impl Into<String>) -> Self {
        Self::MissingHeader(header.into())
    }

    pub fn malformed(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Malformed {
            operation: operation.into(),
            detail: detail.into(),
        }
    }

    pub fn operation(operation: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Operation {
            operation: operation.into(),
            detail: detail.into(),
        }
    }
}

/// Main error type for the extension
#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Lifecycle API error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Liveness marker error: {path}: {reason}")]
    Marker { path: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to connect after {attempts} attempts: {last_error}")]
    ConnectRetriesExhausted { attempts: u32, last_error: String },

    #[error("Client is not connected")]
    NotConnected,

    #[error("Broker is shutting down")]
    ShuttingDown,
}

impl ExtensionError {
    /// Create a configuration error for a named setting
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        ExtensionError::Config(ConfigError::invalid_setting(setting, reason))
    }

    /// Create a configuration error for a setting that has no value
    pub fn config_missing(setting: &str) -> Self {
        ExtensionError::Config(ConfigError::missing(setting))
    }

    /// Create a broker error with operation context
    pub fn broker(operation: &str, detail: impl Into<String>) -> Self {
        ExtensionError::Broker(BrokerError::operation(operation, detail))
    }

    /// Create a broker error for bind failures
    pub fn broker_bind_failed(address: impl Into<String>, reason: impl Into<String>) -> Self {
        ExtensionError::Broker(BrokerError::bind_failed(address, reason))
    }

    /// Create a broker error for connection failures
    pub fn broker_connection(detail: impl Into<String>) -> Self {
        ExtensionError::Broker(BrokerError::connection(detail))
    }

    /// Create a broker error for a background task that ended abnormally
    pub fn broker_task_failed(task: impl Into<String>, detail: impl Into<String>) -> Self {
        ExtensionError::Broker(BrokerError::task_failed(task, detail))
    }

    /// Create a protocol error with context
    ///
    /// # Example
    /// ```ignore
    /// ExtensionError::protocol("parse", "missing subject")
    /// // produces: "Protocol error: parse: missing subject"
    /// ```
    pub fn protocol(operation: &str, detail: impl Into<String>) -> Self {
        ExtensionError::Protocol(format!("{}: {}", operation, detail.into()))
    }

    /// Create a lifecycle error for a non-success HTTP status
    pub fn lifecycle_status(operation: &str, status: u16, body: impl Into<String>) -> Self {
        ExtensionError::Lifecycle(LifecycleError::status(operation, status, body))
    }

    /// Create a lifecycle error for a response that lacks a required header
    pub fn lifecycle_missing_header(header: &str) -> Self {
        ExtensionError::Lifecycle(LifecycleError::missing_header(header))
    }

    /// Create a lifecycle error for an undecodable response body
    pub fn lifecycle_malformed(operation: &str, detail: impl Into<String>) -> Self {
        ExtensionError::Lifecycle(LifecycleError::malformed(operation, detail))
    }

    /// Create a lifecycle error for a transport failure
    pub fn lifecycle(operation: &str, detail: impl Into<String>) -> Self {
        ExtensionError::Lifecycle(LifecycleError::operation(operation, detail))
    }

    /// Create a liveness marker error
    pub fn marker(path: impl Into<String>, reason: impl Into<String>) -> Self {
        ExtensionError::Marker {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the broker connection is gone
    pub fn is_disconnect(&self) -> bool {
        match self {
            ExtensionError::NotConnected | ExtensionError::ShuttingDown => true,
            ExtensionError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::UnexpectedEof
            ),
            ExtensionError::Broker(BrokerError::ConnectionError(_)) => true,
            _ => false,
        }
    }
}
