//! Error types for the core module.

use std::sync::Arc;

use kiln_runner::RunnerError;
use thiserror::Error;

use crate::orchestrator::AbortOperation;

/// Result type alias for core operations.
pub type KilnResult<T> = Result<T, KilnError>;

/// Errors that can occur while assembling or deploying a stack.
///
/// The type is `Clone` so a failed deferred value can hand the very same
/// error to every later reader.
#[derive(Error, Debug, Clone)]
pub enum KilnError {
    /// Invalid or missing props, or invalid wiring. Fatal during assembly.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A deferred value's dependency has not been deployed yet.
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// A deferred value's producer was dropped or panicked before it finished.
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// An external command or API call failed.
    #[error(transparent)]
    Operation(#[from] OperationError),

    /// The orchestrator stopped after an unrecoverable failure.
    #[error(transparent)]
    Abort(Box<AbortOperation>),

    #[error("State error: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    #[error("YAML error: {0}")]
    Yaml(Arc<serde_yaml::Error>),
}

impl KilnError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable(message.into())
    }

    pub fn interrupted(message: impl Into<String>) -> Self {
        Self::Interrupted(message.into())
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self, Self::NotAvailable(_))
    }

    /// Captured output of the failed external action, if this error has one.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Operation(err) if !err.output.is_empty() => Some(&err.output),
            _ => None,
        }
    }
}

/// An external action returned a failure.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct OperationError {
    pub message: String,
    pub command: Option<String>,
    pub exit_code: Option<i32>,
    /// Captured stdout/stderr of the action
    pub output: String,
}

impl OperationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            command: None,
            exit_code: None,
            output: String::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

impl From<RunnerError> for OperationError {
    fn from(err: RunnerError) -> Self {
        let message = err.to_string();
        match err {
            RunnerError::CommandFailed {
                command,
                exit_code,
                output,
            } => Self {
                message,
                command: Some(command),
                exit_code: Some(exit_code),
                output,
            },
            RunnerError::Spawn { command, .. } => Self {
                message,
                command: Some(command),
                exit_code: None,
                output: String::new(),
            },
            RunnerError::ExecutionFailed(_) | RunnerError::Io(_) => Self::new(message),
        }
    }
}

impl From<RunnerError> for KilnError {
    fn from(err: RunnerError) -> Self {
        Self::Operation(err.into())
    }
}

impl From<std::io::Error> for KilnError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}

impl From<serde_yaml::Error> for KilnError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml(Arc::new(err))
    }
}
