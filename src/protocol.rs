//! Wire types for the terminal relay websocket.
//!
//! Payload frames are raw bytes in both directions. The only structured
//! message is the client-to-server resize control frame, sent as JSON text:
//! `{"type":"resize","cols":120,"rows":40}`. Text frames that do not parse as
//! a control message are treated as keystroke input, which keeps the relay
//! compatible with clients that send input as text instead of binary.

use serde::{Deserialize, Serialize};

/// Normal closure: the process exited or the client closed the terminal.
pub const CLOSE_NORMAL: u16 = 1000;
/// Handshake rejected: unknown instance id, or instance not `RUNNING`.
pub const CLOSE_REJECTED: u16 = 4404;
/// Forced closure: the environment expired or was stopped while attached.
pub const CLOSE_EXPIRED: u16 = 4408;
/// Another client is already attached to this instance.
pub const CLOSE_OCCUPIED: u16 = 4409;
/// The PTY could not be attached to the running container.
pub const CLOSE_SPAWN_FAILED: u16 = 4500;

/// Short status word sent as the close reason, so the client can render an
/// accurate indicator without guessing from a generic disconnect.
pub fn close_reason(code: u16) -> &'static str {
    match code {
        CLOSE_NORMAL => "process terminated",
        CLOSE_REJECTED => "instance not running",
        CLOSE_EXPIRED => "instance expired",
        CLOSE_OCCUPIED => "already attached",
        CLOSE_SPAWN_FAILED => "failed to attach to container",
        _ => "closed",
    }
}

/// Control messages a client may send as JSON text frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Resize { cols: u16, rows: u16 },
}

impl ClientMessage {
    /// Parse a text frame as a control message. Returns `None` for anything
    /// that is not one, so the caller can fall back to raw input.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
