//! Terminal relay and environment lifecycle manager for container-backed
//! challenge instances.
//!
//! The relay gateway accepts websocket connections from browser or CLI
//! terminal clients, attaches each one to a PTY-backed shell inside the
//! instance's container, and streams raw bytes both ways. The lifecycle
//! manager provisions the containers, tracks their bounded lifetime, and
//! reclaims them exactly once on stop, disconnect, or expiry.

pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod ports;
pub mod protocol;
pub mod pty;
pub mod registry;
pub mod runtime;
pub mod session;
