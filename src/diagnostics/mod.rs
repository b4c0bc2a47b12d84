//! Error handling and diagnostics for the taskloom scheduler.
//!
//! This module provides the crate-wide error type and result alias. Scheduler
//! lifecycle errors (misconfiguration, worker spawn failures, shutdown
//! ordering mistakes) surface through these types; task admission refusals do
//! not, they are reported as `false` from post methods.

use std::fmt;

/// Result type used throughout the taskloom implementation.
pub type Result<T> = std::result::Result<T, Box<Error>>;

/// Error types for the taskloom scheduler.
#[derive(Debug, Clone)]
pub enum Error {
    /// Misuse of the scheduler lifecycle or invalid parameter combinations
    ConfigurationError {
        /// Human-readable description of the misconfiguration
        message: String,
    },

    /// An OS thread for a worker could not be created
    WorkerSpawnError {
        /// Human-readable description of the spawn failure
        message: String,
    },

    /// Shutdown or join called out of order
    ShutdownError {
        /// Human-readable description of the ordering violation
        message: String,
    },

    /// Internal scheduler errors (bugs)
    InternalError {
        /// Human-readable description of the internal failure
        message: String,
    },
}

impl Error {
    /// Creates a new configuration error.
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Creates a new worker spawn error.
    pub fn worker_spawn_error(message: impl Into<String>) -> Self {
        Self::WorkerSpawnError {
            message: message.into(),
        }
    }

    /// Creates a new shutdown ordering error.
    pub fn shutdown_error(message: impl Into<String>) -> Self {
        Self::ShutdownError {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Converts this error into a boxed error for use with [`Result`].
    pub fn boxed(self) -> Box<Error> {
        Box::new(self)
    }

    /// Returns the error message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Error::ConfigurationError { message }
            | Error::WorkerSpawnError { message }
            | Error::ShutdownError { message }
            | Error::InternalError { message } => message,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigurationError { message } => {
                write!(f, "configuration error: {message}")
            }
            Error::WorkerSpawnError { message } => {
                write!(f, "worker spawn error: {message}")
            }
            Error::ShutdownError { message } => write!(f, "shutdown error: {message}"),
            Error::InternalError { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for Error {}
