//! Host port allocation for environment side services.
//!
//! Each environment gets one port from each base range (ssh, vscode,
//! desktop). A port counts as taken when it is either tracked as allocated or
//! cannot actually be bound on the host, so stale external listeners are
//! skipped rather than handed out.

use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::lifecycle::PortMap;

const SSH_BASE: u16 = 30000;
const VSCODE_BASE: u16 = 31000;
const DESKTOP_BASE: u16 = 32000;
const PORT_RANGE: u16 = 1000;

#[derive(Default)]
pub struct PortAllocator {
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate one port from each range. Rolls back partial allocations on
    /// failure so exhaustion never leaks ports.
    pub fn allocate(&self) -> Result<PortMap> {
        let ssh = self.allocate_from(SSH_BASE)?;
        let vscode = match self.allocate_from(VSCODE_BASE) {
            Ok(port) => port,
            Err(e) => {
                self.release_one(ssh);
                return Err(e);
            }
        };
        let desktop = match self.allocate_from(DESKTOP_BASE) {
            Ok(port) => port,
            Err(e) => {
                self.release_one(ssh);
                self.release_one(vscode);
                return Err(e);
            }
        };
        Ok(PortMap {
            ssh,
            vscode,
            desktop,
        })
    }

    pub fn release(&self, ports: &PortMap) {
        let mut allocated = self.allocated.lock();
        allocated.remove(&ports.ssh);
        allocated.remove(&ports.vscode);
        allocated.remove(&ports.desktop);
    }

    fn allocate_from(&self, base: u16) -> Result<u16> {
        let mut allocated = self.allocated.lock();
        for offset in 0..PORT_RANGE {
            let port = base + offset;
            if allocated.contains(&port) {
                continue;
            }
            if port_is_bindable(port) {
                allocated.insert(port);
                return Ok(port);
            }
        }
        Err(RelayError::Provision(format!(
            "no available ports in range {}-{}",
            base,
            base + PORT_RANGE - 1
        )))
    }

    fn release_one(&self, port: u16) {
        self.allocated.lock().remove(&port);
    }
}

fn port_is_bindable(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
