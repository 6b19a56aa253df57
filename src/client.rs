//! Client terminal adapter: bridges the local terminal to a challenge
//! instance over the relay websocket.
//!
//! The local terminal is put into raw mode and acts as the rendering
//! surface; keystrokes are forwarded as-is while the connection is open
//! (dropped once it closes, matching the relay's write-after-close
//! semantics), window size changes become resize control frames, and the
//! close code from the server is rendered as a short status word.

use std::io::Write as _;

use anyhow::{Context, Result};
use crossterm::terminal;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientMessage, CLOSE_EXPIRED, CLOSE_OCCUPIED, CLOSE_REJECTED};

/// Detach byte (Ctrl-]): ends the local session without touching the remote
/// shell, telnet style.
const DETACH_BYTE: u8 = 0x1d;

/// Connection status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
    MissingData,
}

impl ClientStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientStatus::Connecting => "connecting",
            ClientStatus::Connected => "connected",
            ClientStatus::Disconnected => "disconnected",
            ClientStatus::Error => "error",
            ClientStatus::MissingData => "missing_data",
        }
    }
}

/// Map a server close code to the status word the user sees. Raw errors and
/// stack traces never cross the relay; this is all the client gets.
fn closure_detail(code: u16) -> &'static str {
    match code {
        CLOSE_REJECTED => "instance not running",
        CLOSE_EXPIRED => "instance expired",
        CLOSE_OCCUPIED => "another terminal is already attached",
        _ => "connection closed",
    }
}

fn show_status(status: ClientStatus, detail: Option<&str>) {
    // Raw mode needs explicit \r\n.
    match detail {
        Some(detail) => eprint!("\r\n[{}] {}\r\n", status.as_str(), detail),
        None => eprint!("\r\n[{}]\r\n", status.as_str()),
    }
}

/// Restores the terminal even on early return or panic.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

/// Attach the local terminal to a running instance.
pub async fn run_attach(server: &str, instance_id: &str) -> Result<()> {
    if instance_id.trim().is_empty() {
        show_status(ClientStatus::MissingData, Some("no instance id"));
        anyhow::bail!("instance id is required");
    }

    let url = format!("ws://{server}/ws/terminal/{instance_id}");
    show_status(ClientStatus::Connecting, Some(&url));

    let (ws, _response) = tokio_tungstenite::connect_async(&url)
        .await
        .map_err(|e| {
            show_status(ClientStatus::Error, Some("could not reach relay"));
            anyhow::anyhow!("websocket connect failed: {e}")
        })?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    show_status(ClientStatus::Connected, Some("press Ctrl-] to detach"));
    let _raw = RawModeGuard::enable()?;

    // Report the real geometry before the first prompt renders.
    if let Ok((cols, rows)) = terminal::size() {
        let resize = serde_json::to_string(&ClientMessage::Resize { cols, rows })?;
        ws_tx.send(Message::Text(resize)).await.ok();
    }

    // Blocking stdin reader thread feeding the select loop, as the raw-mode
    // passthrough needs unbuffered bytes rather than line input.
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut sigwinch =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            .context("failed to register SIGWINCH handler")?;

    let mut stdout = std::io::stdout();
    let mut final_status = ClientStatus::Disconnected;
    let mut detail: Option<&'static str> = None;

    loop {
        tokio::select! {
            // Keystrokes -> relay.
            data = stdin_rx.recv() => {
                match data {
                    Some(data) => {
                        if data.contains(&DETACH_BYTE) {
                            break;
                        }
                        // Drop-on-closed; the close frame arrives on the
                        // read side with the real reason.
                        let _ = ws_tx.send(Message::Binary(data)).await;
                    }
                    None => break,
                }
            }

            // Relay -> local terminal surface.
            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        stdout.write_all(&bytes)?;
                        stdout.flush()?;
                    }
                    Some(Ok(Message::Text(text))) => {
                        stdout.write_all(text.as_bytes())?;
                        stdout.flush()?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            detail = Some(closure_detail(u16::from(frame.code)));
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => {
                        final_status = ClientStatus::Error;
                        break;
                    }
                }
            }

            // Local window size change -> resize control frame.
            _ = sigwinch.recv() => {
                if let Ok((cols, rows)) = terminal::size() {
                    let resize = serde_json::to_string(&ClientMessage::Resize { cols, rows })?;
                    let _ = ws_tx.send(Message::Text(resize)).await;
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    show_status(final_status, detail);
    Ok(())
}
