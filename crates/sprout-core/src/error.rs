//! Error types for sprout-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for sprout-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while provisioning and running a sandboxed project.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid run or provider configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The sandbox provider failed to boot an instance
    #[error("sandbox boot failed: {0}")]
    Boot(String),

    /// The provider rejected the mount tree
    #[error("failed to mount project files: {0}")]
    Mount(String),

    /// The provider could not start a process
    #[error("failed to spawn `{command}`: {message}")]
    Spawn {
        /// Command line that was requested
        command: String,
        /// Provider error message
        message: String,
    },

    /// Dependency installation exited unsuccessfully
    #[error("failed to install dependencies (exit code {exit_code})")]
    InstallFailure {
        /// Exit code reported by the install process
        exit_code: i32,
    },

    /// The dev server did not announce an address in time
    #[error("dev server did not become ready within {0:?}")]
    ReadinessTimeout(Duration),

    /// Process output ended before the awaited condition was met
    #[error("process output closed before the dev server became ready")]
    StreamClosed,

    /// Process output stream failed
    #[error("process output failed: {0}")]
    Stream(String),

    /// Writing terminal input to a process failed
    #[error("failed to write to process input: {0}")]
    StreamWrite(String),

    /// A cleanup step failed
    #[error("teardown failed: {0}")]
    Teardown(String),

    /// Invalid session or process state for operation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The operation was abandoned because its session was torn down
    #[error("operation cancelled by teardown")]
    Cancelled,

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
