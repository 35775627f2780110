//! Error types for the PostgreSQL backup core library.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the library's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the backup library.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Error talking to the instance manager endpoints
    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    /// Backup mode did not reach the expected phase
    #[error("Backup mode error: {0}")]
    BackupMode(#[from] BackupModeError),

    /// Archive packing or unpacking error
    #[error("Archive error: {0}")]
    Archive(String),

    /// External dump or replay command exited unsuccessfully
    #[error("Command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WAL markers were read before the backup finished
    #[error("Backup has not been executed yet; WAL markers are unavailable")]
    BackupNotExecuted,

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// A retried operation ran out of attempts
    #[error("{operation}: gave up after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A backup phase failed
    #[error("Backup phase {phase} failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap an error with the name of the phase that produced it.
    pub fn in_phase(self, phase: impl std::fmt::Display) -> Self {
        match self {
            // Cancellation must stay recognisable to the caller.
            Error::Cancelled => Error::Cancelled,
            other => Error::Phase {
                phase: phase.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this error (or the one it wraps) is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Phase { source, .. } | Error::RetryExhausted { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }

    /// Whether this error signals that backup mode has not started yet.
    pub fn is_backup_not_started(&self) -> bool {
        matches!(self, Error::BackupMode(BackupModeError::NotStarted { .. }))
    }

    /// Whether this error signals that backup mode has not stopped yet.
    pub fn is_backup_not_stopped(&self) -> bool {
        matches!(self, Error::BackupMode(BackupModeError::NotStopped { .. }))
    }

    /// Whether this error is a timeout talking to the instance.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Instance(InstanceError::Timeout { .. }) => true,
            Error::Phase { source, .. } | Error::RetryExhausted { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }
}

/// Errors from the instance manager HTTP endpoints.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum InstanceError {
    /// Could not reach the endpoint
    #[error("Failed to connect to {url}: {message}")]
    Connection { url: String, message: String },

    /// The request did not complete in time
    #[error("Request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    /// The endpoint answered with an error
    #[error("{url} returned {status}: {message}")]
    Status {
        url: String,
        status: u16,
        message: String,
    },

    /// The endpoint answered with something we cannot interpret
    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },
}

/// Backup mode phase mismatches. These are the only retryable conditions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackupModeError {
    /// Start was requested but the instance has not confirmed it
    #[error("backup not started (phase: {phase})")]
    NotStarted { phase: String },

    /// Stop was requested but the instance has not confirmed it
    #[error("backup not stopped (phase: {phase})")]
    NotStopped { phase: String },
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The configured bucket does not exist
    #[error("bucket {0}: not found")]
    BucketNotFound(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Storage backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
