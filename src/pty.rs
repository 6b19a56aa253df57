use std::{
    io::{Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::sync::mpsc;

use crate::error::{RelayError, Result};

/// The process side of a session: a byte sink, a resize knob, and an
/// idempotent terminate. Output arrives on the channel returned from spawn
/// and ends when the process exits.
pub trait ProcessHandle: Send + Sync {
    /// Write input bytes to the process. Writes after termination are
    /// dropped silently: the session that would write is itself being torn
    /// down concurrently, so a closed pipe here is not an error.
    fn write_all(&self, bytes: &[u8]) -> Result<()>;

    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    /// Send a termination signal and reap. Idempotent: calling this after
    /// the process has already exited has no effect.
    fn terminate(&self);

    /// Non-blocking exit probe.
    fn has_exited(&self) -> bool;
}

/// Factory seam so the gateway can be exercised without a container runtime.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        container: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(Box<dyn ProcessHandle>, mpsc::Receiver<Vec<u8>>)>;
}

/// Spawns an interactive shell inside a running container via `docker exec`,
/// attached to a fresh PTY.
pub struct DockerExecSpawner {
    shell: String,
}

impl DockerExecSpawner {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl ProcessSpawner for DockerExecSpawner {
    fn spawn(
        &self,
        container: &str,
        rows: u16,
        cols: u16,
    ) -> Result<(Box<dyn ProcessHandle>, mpsc::Receiver<Vec<u8>>)> {
        let args: Vec<String> = vec!["exec".into(), "-it".into(), container.into(), self.shell.clone()];
        let (pty, rx) = PtyProcess::spawn("docker", &args, rows, cols)?;
        Ok((Box::new(pty), rx))
    }
}

/// A PTY-backed child process. One per session; never shared.
pub struct PtyProcess {
    master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send>>>,
    child_pid: Option<u32>,
    reaped: Arc<AtomicBool>,
}

impl PtyProcess {
    pub fn spawn(
        program: &str,
        args: &[String],
        rows: u16,
        cols: u16,
    ) -> Result<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to spawn {program}: {e}")))?;
        let child_pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| RelayError::ProcessSpawn(format!("failed to take pty writer: {e}")))?;

        // Blocking reader thread; the channel closing is the end-of-output
        // signal the session's copy task waits on.
        let (tx, rx) = mpsc::channel(256);
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        Ok((
            Self {
                master: Mutex::new(pair.master),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                child_pid,
                reaped: Arc::new(AtomicBool::new(false)),
            },
            rx,
        ))
    }
}

impl ProcessHandle for PtyProcess {
    fn write_all(&self, bytes: &[u8]) -> Result<()> {
        if self.reaped.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut guard = self.writer.lock();
        if let Err(e) = guard.write_all(bytes).and_then(|()| guard.flush()) {
            // Broken pipe after exit is the already-closing case, not a fault.
            if self.has_exited() {
                return Ok(());
            }
            return Err(RelayError::ConnectionLost(format!("pty write: {e}")));
        }
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| RelayError::ConnectionLost(format!("pty resize: {e}")))
    }

    fn terminate(&self) {
        if self.reaped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut child = self.child.lock();
        let _ = child.kill();
        let _ = child.wait();
        tracing::debug!(
            target = "challenge_relay::pty",
            pid = ?self.child_pid,
            "pty process terminated"
        );
    }

    fn has_exited(&self) -> bool {
        if self.reaped.load(Ordering::Relaxed) {
            return true;
        }

        {
            let mut child = self.child.lock();
            match child.try_wait() {
                Ok(Some(_status)) => {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    // ECHILD: someone else already reaped it.
                    tracing::debug!(
                        target = "challenge_relay::pty",
                        pid = ?self.child_pid,
                        error = %e,
                        "try_wait failed, treating as exited"
                    );
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        // Fallback: kill(pid, 0) catches a process that is truly gone while
        // waitpid is confused.
        #[cfg(unix)]
        if let Some(pid) = self.child_pid {
            // SAFETY: signal 0 performs no delivery, only an existence check.
            let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if ret == -1 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno == libc::ESRCH {
                    self.reaped.store(true, Ordering::Relaxed);
                    return true;
                }
            }
        }

        false
    }
}
