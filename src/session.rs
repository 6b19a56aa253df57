//! One live terminal session: a websocket paired with a PTY-backed process.
//!
//! The session task has two suspension points (read-from-process and
//! read-from-client) plus the environment-status watch as a single
//! cancellation signal, composed with `tokio::select!`. Byte order is
//! preserved within each direction; the two directions are independent.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tokio::sync::{mpsc, watch};

use crate::lifecycle::EnvStatus;
use crate::protocol::{close_reason, ClientMessage, CLOSE_EXPIRED, CLOSE_NORMAL};
use crate::pty::ProcessHandle;
use crate::registry::{SessionRegistry, SessionState, SessionToken};

pub struct Session {
    instance_id: String,
    token: SessionToken,
    registry: Arc<SessionRegistry>,
    process: Arc<dyn ProcessHandle>,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(
        instance_id: impl Into<String>,
        token: SessionToken,
        registry: Arc<SessionRegistry>,
        process: Box<dyn ProcessHandle>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            token,
            registry,
            process: Arc::from(process),
            torn_down: AtomicBool::new(false),
        }
    }

    /// Relay bytes until the process exits, the client disconnects, or the
    /// environment leaves `RUNNING`. Consumes the socket; teardown always
    /// runs exactly once before this returns.
    pub async fn run(
        self,
        mut socket: WebSocket,
        mut output_rx: mpsc::Receiver<Vec<u8>>,
        mut status_rx: watch::Receiver<EnvStatus>,
    ) {
        self.registry
            .set_state(&self.instance_id, self.token, SessionState::Active);
        tracing::info!(
            target = "challenge_relay::session",
            instance = %self.instance_id,
            "session active"
        );

        let close_code = loop {
            tokio::select! {
                // Process output -> client, order preserved.
                chunk = output_rx.recv() => {
                    match chunk {
                        Some(bytes) => {
                            if socket.send(Message::Binary(bytes.into())).await.is_err() {
                                // Client link dropped mid-write.
                                break None;
                            }
                        }
                        // Channel closed: the process exited.
                        None => break Some(CLOSE_NORMAL),
                    }
                }

                // Client input -> process.
                msg = socket.recv() => {
                    match msg {
                        Some(Ok(Message::Binary(bytes))) => {
                            if self.process.write_all(&bytes).is_err() {
                                break Some(CLOSE_NORMAL);
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            match ClientMessage::parse(&text) {
                                Some(ClientMessage::Resize { cols, rows }) => {
                                    // Forwarded directly; no reply.
                                    let _ = self.process.resize(cols, rows);
                                }
                                None => {
                                    if self.process.write_all(text.as_bytes()).is_err() {
                                        break Some(CLOSE_NORMAL);
                                    }
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break None,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::debug!(
                                target = "challenge_relay::session",
                                instance = %self.instance_id,
                                error = %error,
                                "client link error"
                            );
                            break None;
                        }
                    }
                }

                // Environment left RUNNING: forced reclamation must not wait
                // for a slow client or process.
                changed = status_rx.changed() => {
                    let still_running =
                        changed.is_ok() && *status_rx.borrow() == EnvStatus::Running;
                    if !still_running {
                        break Some(CLOSE_EXPIRED);
                    }
                }
            }
        };

        self.teardown(Some(socket), close_code).await;
    }

    /// Exactly-once cleanup: terminate the process, close the client link
    /// with a reason code, remove the registry entry. Safe to call from
    /// racing paths; only the first caller executes the body.
    pub async fn teardown(&self, socket: Option<WebSocket>, close_code: Option<u16>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry
            .set_state(&self.instance_id, self.token, SessionState::Closing);

        self.process.terminate();

        if let Some(mut socket) = socket {
            if let Some(code) = close_code {
                let frame = CloseFrame {
                    code,
                    reason: close_reason(code).into(),
                };
                let _ = socket.send(Message::Close(Some(frame))).await;
            }
            // Dropping the socket finishes the close handshake either way.
        }

        self.registry.remove(&self.instance_id, self.token);
        tracing::info!(
            target = "challenge_relay::session",
            instance = %self.instance_id,
            code = ?close_code,
            "session closed"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Belt and braces for cancelled tasks: the process resource and the
        // registry entry must not outlive the session.
        if !self.torn_down.swap(true, Ordering::SeqCst) {
            self.process.terminate();
            self.registry.remove(&self.instance_id, self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::sync::atomic::AtomicUsize;

    struct CountingProcess {
        terminations: Arc<AtomicUsize>,
    }

    impl ProcessHandle for CountingProcess {
        fn write_all(&self, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }
        fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }
        fn terminate(&self) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
        fn has_exited(&self) -> bool {
            false
        }
    }

    fn counting_session(
        registry: &Arc<SessionRegistry>,
        terminations: &Arc<AtomicUsize>,
    ) -> Session {
        let token = registry.insert("env-1").unwrap();
        Session::new(
            "env-1",
            token,
            registry.clone(),
            Box::new(CountingProcess {
                terminations: terminations.clone(),
            }),
        )
    }

    #[tokio::test]
    async fn teardown_runs_exactly_once() {
        let registry = Arc::new(SessionRegistry::new());
        let terminations = Arc::new(AtomicUsize::new(0));
        let session = counting_session(&registry, &terminations);

        session.teardown(None, Some(CLOSE_NORMAL)).await;
        session.teardown(None, Some(CLOSE_EXPIRED)).await;

        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn concurrent_teardown_triggers_terminate_once() {
        let registry = Arc::new(SessionRegistry::new());
        let terminations = Arc::new(AtomicUsize::new(0));
        let session = Arc::new(counting_session(&registry, &terminations));

        let a = {
            let session = session.clone();
            tokio::spawn(async move { session.teardown(None, None).await })
        };
        let b = {
            let session = session.clone();
            tokio::spawn(async move { session.teardown(None, None).await })
        };
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn drop_without_run_still_cleans_up() {
        let registry = Arc::new(SessionRegistry::new());
        let terminations = Arc::new(AtomicUsize::new(0));
        let session = counting_session(&registry, &terminations);

        drop(session);

        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }
}
