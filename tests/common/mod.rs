//! Shared test doubles: a recording container runtime and a recording
//! process spawner, so lifecycle and relay behavior can be exercised without
//! Docker or a real PTY.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use challenge_relay::error::{RelayError, Result};
use challenge_relay::lifecycle::PortMap;
use challenge_relay::pty::{ProcessHandle, ProcessSpawner};
use challenge_relay::runtime::ContainerRuntime;

#[derive(Default)]
pub struct MockRuntime {
    pub runs: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_run: AtomicBool,
    pub fail_next_stop: AtomicBool,
    /// Artificial provisioning latency, for tests that race the start path.
    pub run_delay_ms: AtomicU64,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn run_container(
        &self,
        _name: &str,
        _image: &str,
        _flag: &str,
        _ports: &PortMap,
    ) -> Result<()> {
        let delay = self.run_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_run.load(Ordering::SeqCst) {
            return Err(RelayError::Runtime("image pull failed".into()));
        }
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_container(&self, _name: &str) -> Result<()> {
        if self.fail_next_stop.swap(false, Ordering::SeqCst) {
            return Err(RelayError::Runtime("docker stop timed out".into()));
        }
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn container_exists(&self, _name: &str) -> bool {
        true
    }
}

/// Everything a test wants to observe about spawned fake processes.
#[derive(Default)]
pub struct SpawnRecord {
    pub spawns: AtomicUsize,
    pub terminations: AtomicUsize,
    pub input: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u16, u16)>>,
    /// Held open so the fake process output channel stays "alive"; a test
    /// pushes output chunks through it, or drops it to simulate exit.
    pub output_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl SpawnRecord {
    pub fn take_output_tx(&self) -> Option<mpsc::Sender<Vec<u8>>> {
        self.output_tx.lock().take()
    }
}

pub struct FakeProcess {
    record: Arc<SpawnRecord>,
}

impl ProcessHandle for FakeProcess {
    fn write_all(&self, bytes: &[u8]) -> Result<()> {
        self.record.input.lock().extend_from_slice(bytes);
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.record.resizes.lock().push((cols, rows));
        Ok(())
    }

    fn terminate(&self) {
        self.record.terminations.fetch_add(1, Ordering::SeqCst);
        // Closing the sender ends the output stream like a real exit.
        self.record.output_tx.lock().take();
    }

    fn has_exited(&self) -> bool {
        self.record.output_tx.lock().is_none()
    }
}

pub struct FakeSpawner {
    pub record: Arc<SpawnRecord>,
    pub fail: AtomicBool,
}

impl FakeSpawner {
    pub fn new() -> (Arc<Self>, Arc<SpawnRecord>) {
        let record = Arc::new(SpawnRecord::default());
        (
            Arc::new(Self {
                record: record.clone(),
                fail: AtomicBool::new(false),
            }),
            record,
        )
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        _container: &str,
        _rows: u16,
        _cols: u16,
    ) -> Result<(Box<dyn ProcessHandle>, mpsc::Receiver<Vec<u8>>)> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RelayError::ProcessSpawn("container not running".into()));
        }
        self.record.spawns.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(256);
        *self.record.output_tx.lock() = Some(tx);
        Ok((
            Box::new(FakeProcess {
                record: self.record.clone(),
            }),
            rx,
        ))
    }
}
