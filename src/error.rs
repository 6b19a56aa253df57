//! Error taxonomy for the relay and lifecycle manager.

use thiserror::Error;

use crate::protocol::{CLOSE_OCCUPIED, CLOSE_REJECTED, CLOSE_SPAWN_FAILED};

/// Errors surfaced by the relay gateway and the environment lifecycle manager.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The container for a new environment failed to start.
    /// The environment is left in `ERROR`.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Attaching a PTY to an already-running container failed.
    /// The environment stays `RUNNING` so a retry can attach.
    #[error("pty spawn failed: {0}")]
    ProcessSpawn(String),

    /// The websocket handshake referenced an unknown or non-running instance.
    /// No resources were allocated.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The instance already has an attached session.
    #[error("instance {0} already has an active session")]
    AlreadyAttached(String),

    /// The configured concurrency limit is reached; requests are rejected,
    /// never queued.
    #[error("instance quota exceeded ({0} running)")]
    QuotaExceeded(usize),

    /// No environment with this instance id.
    #[error("instance not found: {0}")]
    NotFound(String),

    /// A container runtime invocation failed.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// Either side of a relay dropped. Terminal for the session, not a
    /// platform error.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// True when the error should be reported to the requester as "not found"
    /// rather than a server fault.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when a fresh attach attempt may succeed without operator action.
    pub fn is_retryable_attach(&self) -> bool {
        matches!(self, Self::ProcessSpawn(_) | Self::ConnectionLost(_))
    }

    /// Websocket close code for errors that reject or end a terminal
    /// connection. `None` for errors with no frame to send: a lost link has
    /// no peer left to close, and 4408 is reserved for expiry/stop so the
    /// client can tell a forced teardown from a dropped connection.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::HandshakeRejected(_) | Self::NotFound(_) => Some(CLOSE_REJECTED),
            Self::AlreadyAttached(_) => Some(CLOSE_OCCUPIED),
            Self::ProcessSpawn(_) => Some(CLOSE_SPAWN_FAILED),
            _ => None,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
