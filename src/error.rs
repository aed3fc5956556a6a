//! Error types for the sandbox orchestrator.
//!
//! Fatal failures are `Error` values. Problems that must not abort a
//! teardown sequence are reported as `CleanupWarning`s instead and collected
//! into the report of the operation that hit them.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sandbox operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration detected before anything was spawned
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No server binary on the search path
    #[error(
        "mongod binary not found in {} search directories; \
         please specify the path to the binary with `binary_path`",
        .searched.len()
    )]
    BinaryNotFound { searched: Vec<PathBuf> },

    /// Could not obtain a port from the OS
    #[error("Could not allocate a port on {host}: {source}")]
    ResourceAllocation {
        host: String,
        #[source]
        source: io::Error,
    },

    /// The server process could not be spawned
    #[error("Failed to spawn {}: {source}", .binary.display())]
    ProcessStart {
        binary: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The server never accepted connections within the readiness bound
    #[error("Server at {endpoint} not reachable after {waited:?}")]
    ReadinessTimeout { endpoint: String, waited: Duration },

    /// The server exited before it became ready
    #[error("Server exited during startup (exit code {code:?})")]
    ServerExited { code: Option<i32> },

    /// Connecting to or enumerating the logical database failed
    #[error("Cleanup failed: {0}")]
    Cleanup(#[from] StoreError),

    /// The data directory survived `stop`. Carries the warnings raised while
    /// stopping the process before removal was attempted.
    #[error("Failed to remove data directory {}: {source}", .path.display())]
    DataDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
        warnings: Vec<CleanupWarning>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the errors that mean "fix your configuration".
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::BinaryNotFound { .. })
    }
}

/// Failure reported by a `CollectionStore`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct StoreError {
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        StoreError { message: message.into() }
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        StoreError::new(e.to_string())
    }
}

/// Non-fatal problem hit while tearing something down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupWarning {
    /// Dropping a user collection failed
    DropFailed { collection: String, message: String },
    /// Signalling or reaping the server process failed
    Terminate { message: String },
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupWarning::DropFailed { collection, message } => {
                write!(f, "could not drop collection {collection}: {message}")
            }
            CleanupWarning::Terminate { message } => {
                write!(f, "could not terminate server: {message}")
            }
        }
    }
}
