use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

/// Result of a single task body.
pub type TaskResult<T> = anyhow::Result<T, anyhow::Error>;

#[derive(Debug, Error, Clone)]
pub enum Error {
    #[error("Value has no stable content hash: {0}")]
    UnhashableValue(String),

    #[error("Dependency cycle through task '{label}' ({hash})")]
    CyclicGraph { label: String, hash: String },

    #[error("Component {component}: no entry at key '{key}'")]
    ComponentIndex { component: String, key: String },

    #[error("Task '{label}' ({hash}) failed:\n{error:#}")]
    TaskExecution {
        label: String,
        hash: String,
        error: Arc<anyhow::Error>,
    },

    #[error("Task '{label}' ({hash}) was not run because a dependency failed:\n{cause}")]
    DependencyFailed {
        label: String,
        hash: String,
        cause: Box<Error>,
    },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Couldn't spawn '{program}': {error}")]
    Spawn {
        program: String,
        error: Arc<std::io::Error>,
    },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Failed to build runtime: {0}")]
    Runtime(Arc<std::io::Error>),

    #[error("Internal scheduler error: {0}")]
    Internal(String),
}

impl Error {
    /// Follows `DependencyFailed` links down to the failure that started the
    /// propagation.
    pub fn root_cause(&self) -> &Error {
        let mut current = self;
        while let Error::DependencyFailed { cause, .. } = current {
            current = cause;
        }
        current
    }

    /// Hash prefix of the task this error is attributed to, if any.
    pub fn task_hash(&self) -> Option<&str> {
        match self {
            Error::TaskExecution { hash, .. }
            | Error::DependencyFailed { hash, .. }
            | Error::CyclicGraph { hash, .. } => Some(hash),
            _ => None,
        }
    }

    pub(crate) fn unhashable(msg: impl Into<String>) -> Self {
        Error::UnhashableValue(msg.into())
    }
}

/// A subprocess finished with a non-zero exit status.
///
/// The captured streams are kept so that the failing step can be diagnosed
/// from the error alone.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Process '{program}' exited with code {code}\n--- stderr ---\n{stderr}")]
pub struct ProcessError {
    pub program: String,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}
