//! Error types for step execution, the container engine client and the
//! controller collaborators.

use flowci_types::{StepSpecError, VariableError};
use thiserror::Error;

/// Errors raised while preparing or running a step.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Malformed step descriptor or agent configuration; never retried.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Transient failure of the host process API, container engine or pod runtime.
    #[error("Backend error: {message}")]
    Backend { message: String },

    #[error("Step cancelled")]
    Cancelled,

    /// User script exited with a non-zero code.
    #[error("Step exited with code {code}")]
    Step { code: i32 },

    #[error("An interactive session is already open")]
    AlreadyInteracting,

    #[error("Step is not running")]
    NotRunning,

    #[error("Operation not supported by this backend: {operation}")]
    Unsupported { operation: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend { message: message.into() }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    /// Whether the step-level retry loop may re-run the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Step { .. } | Self::Io(_))
    }
}

impl From<StepSpecError> for ExecutorError {
    fn from(error: StepSpecError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<VariableError> for ExecutorError {
    fn from(error: VariableError) -> Self {
        Self::config(error.to_string())
    }
}

impl From<DockerError> for ExecutorError {
    fn from(error: DockerError) -> Self {
        Self::backend(error.to_string())
    }
}

/// Errors returned by the Docker engine client.
#[derive(Debug, Error)]
pub enum DockerError {
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Docker API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Docker transport error: {message}")]
    Transport { message: String },

    #[error("Docker response decode error: {message}")]
    Decode { message: String },
}

impl DockerError {
    /// Create a not found error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into() }
    }

    /// Create an API error.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport { message: message.into() }
    }

    /// Create a decode error.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode { message: message.into() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<reqwest::Error> for DockerError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::decode(error.to_string())
        } else {
            Self::transport(error.to_string())
        }
    }
}

impl From<std::io::Error> for DockerError {
    fn from(error: std::io::Error) -> Self {
        Self::transport(error.to_string())
    }
}

impl From<serde_json::Error> for DockerError {
    fn from(error: serde_json::Error) -> Self {
        Self::decode(error.to_string())
    }
}

/// Errors returned by controller collaborators.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("HTTP error: {message}")]
    Http { message: String },

    #[error("Controller returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Controller connection closed")]
    Closed,
}

impl ControllerError {
    /// Create an HTTP transport error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http { message: message.into() }
    }

    /// Create an unexpected status error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Create a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol { message: message.into() }
    }
}

/// Errors returned by the dispatcher when accepting a command.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent is busy with step {step_id}")]
    Busy { step_id: String },

    #[error("No step is running")]
    Idle,

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

impl DispatchError {
    pub fn busy(step_id: impl Into<String>) -> Self {
        Self::Busy { step_id: step_id.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(ExecutorError::Step { code: 1 }.is_retryable());
        assert!(ExecutorError::backend("engine down").is_retryable());
        assert!(!ExecutorError::config("bad volume").is_retryable());
        assert!(!ExecutorError::Cancelled.is_retryable());
    }

    #[test]
    fn descriptor_errors_map_to_config() {
        let error: ExecutorError = StepSpecError::malformed_volume("x", "bad").into();
        assert!(matches!(error, ExecutorError::Config { .. }));
        let error: ExecutorError = DockerError::not_found("container abc").into();
        assert!(matches!(error, ExecutorError::Backend { .. }));
    }
}
