//! Error types for the server core.
//!
//! Errors that travel through the [`ServerHandle`](crate::ServerHandle)'s
//! address channel must be `Clone`, so bind failures capture the
//! [`std::io::ErrorKind`] and message instead of the `io::Error` itself.

use std::io;

use thiserror::Error;

/// Errors observable through the server handle.
///
/// Per-connection failures never surface here: a handler or stream error
/// ends that one connection and nothing else.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Failed to acquire the listening socket. Fatal to the start attempt;
    /// the accept loop performs no retry.
    #[error("failed to bind {addr}: {message}")]
    Bind {
        /// The address the server attempted to bind.
        addr: String,
        /// Kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// Message of the underlying I/O error.
        message: String,
    },

    /// The server entered shutdown before the operation could complete.
    #[error("server is shutting down")]
    Shutdown,

    /// The server was cancelled before it ever bound its listener
    /// (including the never-started sentinel handle).
    #[error("server was cancelled before it started listening")]
    Cancelled,
}

impl ServerError {
    pub(crate) fn bind(addr: impl Into<String>, err: &io::Error) -> Self {
        Self::Bind {
            addr: addr.into(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Errors returned by the idle-timeout queue.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimeoutError {
    /// The queue was torn down; the caller must treat the connection as
    /// already timed out.
    #[error("timeout queue is shut down")]
    Shutdown,
}

/// A dispatcher refused to take on a new task.
///
/// Recovered locally by the accept loop: the rejected connection is closed
/// and accepting continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("task dispatch rejected: {reason}")]
pub struct SpawnError {
    reason: String,
}

impl SpawnError {
    /// Creates a new rejection with the given reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Returns the rejection reason.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}
