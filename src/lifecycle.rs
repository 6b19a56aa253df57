//! Environment lifecycle manager: provisioning, state tracking, expiry.
//!
//! Every provisioned environment is one container plus a table entry carrying
//! its deadline. All status transitions happen under the table lock, so a
//! client-initiated stop and the expiry sweep racing each other converge on
//! exactly one container teardown. Sessions learn about transitions through a
//! per-instance watch channel rather than by polling.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::{sync::watch, time::MissedTickBehavior};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::ports::PortAllocator;
use crate::runtime::ContainerRuntime;

/// Closed set of environment states. Transitions go through
/// [`EnvStatus::can_transition_to`]; anything else is a bug, not a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvStatus {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Expired,
    Error,
}

impl EnvStatus {
    pub fn can_transition_to(self, to: EnvStatus) -> bool {
        use EnvStatus::*;
        matches!(
            (self, to),
            (Provisioning, Running)
                | (Provisioning, Error)
                | (Running, Stopping)
                | (Running, Expired)
                | (Stopping, Stopped)
                // Expired is Stopping under a different name, kept distinct
                // for reporting.
                | (Expired, Stopped)
        )
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, EnvStatus::Stopped | EnvStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EnvStatus::Provisioning => "PROVISIONING",
            EnvStatus::Running => "RUNNING",
            EnvStatus::Stopping => "STOPPING",
            EnvStatus::Stopped => "STOPPED",
            EnvStatus::Expired => "EXPIRED",
            EnvStatus::Error => "ERROR",
        }
    }
}

/// Host ports mapped onto the container's auxiliary services. Opaque to the
/// relay itself; clients use them for ssh/vscode/desktop access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMap {
    pub ssh: u16,
    pub vscode: u16,
    pub desktop: u16,
}

/// One provisioned, time-bounded environment.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub instance_id: String,
    pub challenge_id: String,
    /// Runtime handle, owned by the lifecycle manager. Never serialized to
    /// clients.
    #[serde(skip)]
    pub container_name: String,
    pub status: EnvStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub ports: PortMap,
    /// Set when the deadline drove the teardown, so a converged `STOPPED`
    /// record still reports the expiry.
    pub expired: bool,
    pub flag_hash: String,
}

impl Environment {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

struct EnvEntry {
    env: Environment,
    status_tx: watch::Sender<EnvStatus>,
    /// Claimed by whichever caller is currently stopping the container, so
    /// the sweep's reconciliation never doubles up on an in-flight teardown.
    teardown_in_flight: bool,
    /// Set when a stop request arrives while the container is still
    /// provisioning; honored at the `Running` transition.
    stop_requested: bool,
    /// When the entry reached a terminal state; pruned after the retention
    /// window.
    finished_at: Option<DateTime<Utc>>,
}

impl EnvEntry {
    /// Apply a transition and notify watchers. Returns false (and leaves the
    /// entry untouched) when the transition is not in the table.
    fn transition(&mut self, to: EnvStatus) -> bool {
        if !self.env.status.can_transition_to(to) {
            tracing::debug!(
                target = "challenge_relay::lifecycle",
                instance = %self.env.instance_id,
                from = self.env.status.as_str(),
                to = to.as_str(),
                "ignoring illegal transition"
            );
            return false;
        }
        self.env.status = to;
        if to.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        // send_replace records the value even with no receiver alive, so a
        // session subscribing after the fact still observes the transition.
        self.status_tx.send_replace(to);
        true
    }
}

/// How long a terminal (`STOPPED`/`ERROR`) record stays queryable before the
/// sweep prunes it from the table.
const TERMINAL_RETENTION_SECS: i64 = 300;

pub struct LifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    catalog: HashMap<String, String>,
    envs: Mutex<HashMap<String, EnvEntry>>,
    ports: PortAllocator,
    ttl: chrono::Duration,
    max_instances: usize,
    terminal_retention: chrono::Duration,
}

impl LifecycleManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        catalog: HashMap<String, String>,
        ttl: Duration,
        max_instances: usize,
    ) -> Self {
        Self {
            runtime,
            catalog,
            envs: Mutex::new(HashMap::new()),
            ports: PortAllocator::new(),
            ttl: chrono::Duration::from_std(ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800)),
            max_instances,
            terminal_retention: chrono::Duration::seconds(TERMINAL_RETENTION_SECS),
        }
    }

    /// Override how long finished records stay queryable.
    pub fn with_terminal_retention(mut self, retention: Duration) -> Self {
        self.terminal_retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::seconds(TERMINAL_RETENTION_SECS));
        self
    }

    /// Provision an environment for a challenge. Returns the existing
    /// instance when one is already running for that challenge; rejects when
    /// the quota is reached (never queues).
    pub async fn start(&self, challenge_id: &str) -> Result<Environment> {
        let image = self
            .catalog
            .get(challenge_id)
            .cloned()
            .ok_or_else(|| {
                RelayError::Provision(format!(
                    "challenge {challenge_id} does not define a launchable image"
                ))
            })?;

        let (instance_id, container_name, flag, ports) = {
            let mut envs = self.envs.lock();

            if let Some(entry) = envs
                .values()
                .find(|e| e.env.challenge_id == challenge_id && e.env.status == EnvStatus::Running)
            {
                return Ok(entry.env.clone());
            }

            let live = envs
                .values()
                .filter(|e| {
                    matches!(
                        e.env.status,
                        EnvStatus::Provisioning | EnvStatus::Running
                    )
                })
                .count();
            if self.max_instances > 0 && live >= self.max_instances {
                return Err(RelayError::QuotaExceeded(live));
            }

            let ports = self.ports.allocate()?;
            let instance_id = Uuid::new_v4().to_string();
            let container_name = format!("ctf-{}", &instance_id[..8]);
            let flag = generate_flag(challenge_id);

            let now = Utc::now();
            let (status_tx, _) = watch::channel(EnvStatus::Provisioning);
            let env = Environment {
                instance_id: instance_id.clone(),
                challenge_id: challenge_id.to_string(),
                container_name: container_name.clone(),
                status: EnvStatus::Provisioning,
                created_at: now,
                expires_at: now + self.ttl,
                ports,
                expired: false,
                flag_hash: sha256_hex(&flag),
            };
            envs.insert(
                instance_id.clone(),
                EnvEntry {
                    env,
                    status_tx,
                    teardown_in_flight: false,
                    stop_requested: false,
                    finished_at: None,
                },
            );
            (instance_id, container_name, flag, ports)
        };

        match self
            .runtime
            .run_container(&container_name, &image, &flag, &ports)
            .await
        {
            Ok(()) => {
                let (env, pending_stop) = {
                    let mut envs = self.envs.lock();
                    let entry = envs
                        .get_mut(&instance_id)
                        .ok_or_else(|| RelayError::NotFound(instance_id.clone()))?;
                    // The TTL window starts at RUNNING entry, not at the
                    // request.
                    let now = Utc::now();
                    entry.env.created_at = now;
                    entry.env.expires_at = now + self.ttl;
                    entry.transition(EnvStatus::Running);
                    // A stop that raced the provisioning is honored here
                    // instead of being lost.
                    if entry.stop_requested {
                        entry.transition(EnvStatus::Stopping);
                        entry.teardown_in_flight = true;
                    }
                    (entry.env.clone(), entry.stop_requested)
                };
                if pending_stop {
                    tracing::info!(
                        target = "challenge_relay::lifecycle",
                        instance = %instance_id,
                        challenge = %challenge_id,
                        "stop requested during provisioning, tearing down"
                    );
                    return self.finish_teardown(&instance_id, &container_name).await;
                }
                tracing::info!(
                    target = "challenge_relay::lifecycle",
                    instance = %instance_id,
                    challenge = %challenge_id,
                    container = %container_name,
                    expires_at = %env.expires_at,
                    "environment running"
                );
                Ok(env)
            }
            Err(e) => {
                let mut envs = self.envs.lock();
                if let Some(entry) = envs.get_mut(&instance_id) {
                    entry.transition(EnvStatus::Error);
                    self.ports.release(&entry.env.ports);
                }
                tracing::warn!(
                    target = "challenge_relay::lifecycle",
                    instance = %instance_id,
                    challenge = %challenge_id,
                    error = %e,
                    "provisioning failed"
                );
                Err(RelayError::Provision(e.to_string()))
            }
        }
    }

    /// Stop an environment. Idempotent: stopping an already-terminal
    /// environment returns its current state. Exactly one caller performs the
    /// container teardown; racers observe the in-flight state.
    pub async fn stop(&self, instance_id: &str) -> Result<Environment> {
        let container_name = {
            let mut envs = self.envs.lock();
            let entry = envs
                .get_mut(instance_id)
                .ok_or_else(|| RelayError::NotFound(instance_id.to_string()))?;

            match entry.env.status {
                EnvStatus::Running => {
                    // This caller won the single-writer race.
                    entry.transition(EnvStatus::Stopping);
                    entry.teardown_in_flight = true;
                    entry.env.container_name.clone()
                }
                // Too early to tear down; recorded and honored once the
                // container confirms its start.
                EnvStatus::Provisioning => {
                    entry.stop_requested = true;
                    return Ok(entry.env.clone());
                }
                // Teardown already in flight or finished.
                _ => return Ok(entry.env.clone()),
            }
        };

        self.finish_teardown(instance_id, &container_name).await
    }

    /// Current record for an instance, if any.
    pub fn status(&self, instance_id: &str) -> Option<Environment> {
        self.envs.lock().get(instance_id).map(|e| e.env.clone())
    }

    /// Watch receiver for an instance's status. The session layer selects on
    /// this as its cancellation signal: any value other than `Running` means
    /// the session must close.
    pub fn subscribe(&self, instance_id: &str) -> Option<watch::Receiver<EnvStatus>> {
        self.envs
            .lock()
            .get(instance_id)
            .map(|e| e.status_tx.subscribe())
    }

    /// All known environment records, in no particular order.
    pub fn list(&self) -> Vec<Environment> {
        self.envs.lock().values().map(|e| e.env.clone()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.envs
            .lock()
            .values()
            .filter(|e| e.env.status == EnvStatus::Running)
            .count()
    }

    /// One expiry pass: move every `RUNNING` environment past its deadline to
    /// `EXPIRED` and reclaim it, retry environments stuck in
    /// `STOPPING`/`EXPIRED` from an earlier failed teardown, and prune
    /// terminal records past the retention window.
    pub async fn sweep_once(&self) {
        let now = Utc::now();

        self.envs.lock().retain(|id, entry| match entry.finished_at {
            Some(done) if now - done >= self.terminal_retention => {
                tracing::debug!(
                    target = "challenge_relay::lifecycle",
                    instance = %id,
                    status = entry.env.status.as_str(),
                    "pruning finished environment record"
                );
                false
            }
            _ => true,
        });

        let due: Vec<(String, String, bool)> = {
            let mut envs = self.envs.lock();
            envs.iter_mut()
                .filter_map(|(id, entry)| match entry.env.status {
                    EnvStatus::Running if entry.env.is_past_deadline(now) => {
                        entry.env.expired = true;
                        entry.transition(EnvStatus::Expired);
                        entry.teardown_in_flight = true;
                        Some((id.clone(), entry.env.container_name.clone(), true))
                    }
                    // Reconciliation pass for a previously failed stop.
                    EnvStatus::Stopping | EnvStatus::Expired if !entry.teardown_in_flight => {
                        entry.teardown_in_flight = true;
                        Some((id.clone(), entry.env.container_name.clone(), false))
                    }
                    _ => None,
                })
                .collect()
        };

        for (instance_id, container_name, fresh) in due {
            if fresh {
                tracing::info!(
                    target = "challenge_relay::lifecycle",
                    instance = %instance_id,
                    "environment expired, reclaiming"
                );
            }
            if let Err(e) = self.finish_teardown(&instance_id, &container_name).await {
                tracing::warn!(
                    target = "challenge_relay::lifecycle",
                    instance = %instance_id,
                    error = %e,
                    "teardown failed, will retry on next sweep"
                );
            }
        }
    }

    /// Run the expiry sweep until the process exits.
    pub async fn run_sweep(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.sweep_once().await;
        }
    }

    /// Stop the container and finalize the entry. The caller must already
    /// hold the teardown (status moved to `Stopping`/`Expired`). On runtime
    /// failure the entry stays where it is for the next sweep.
    async fn finish_teardown(&self, instance_id: &str, container_name: &str) -> Result<Environment> {
        if let Err(e) = self.runtime.stop_container(container_name).await {
            // Release the claim so the next sweep pass retries.
            let mut envs = self.envs.lock();
            if let Some(entry) = envs.get_mut(instance_id) {
                entry.teardown_in_flight = false;
            }
            return Err(e);
        }

        let mut envs = self.envs.lock();
        let entry = envs
            .get_mut(instance_id)
            .ok_or_else(|| RelayError::NotFound(instance_id.to_string()))?;
        if entry.transition(EnvStatus::Stopped) {
            self.ports.release(&entry.env.ports);
            tracing::info!(
                target = "challenge_relay::lifecycle",
                instance = %instance_id,
                expired = entry.env.expired,
                "environment stopped"
            );
        }
        Ok(entry.env.clone())
    }
}

fn generate_flag(challenge_id: &str) -> String {
    let mut random = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut random);
    let hex: String = random.iter().map(|b| format!("{b:02x}")).collect();
    format!("FLAG{{{challenge_id}_{hex}}}")
}

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_matches_the_state_machine() {
        use EnvStatus::*;
        assert!(Provisioning.can_transition_to(Running));
        assert!(Provisioning.can_transition_to(Error));
        assert!(Running.can_transition_to(Stopping));
        assert!(Running.can_transition_to(Expired));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(Expired.can_transition_to(Stopped));

        // Terminal states stay terminal.
        for from in [Stopped, Error] {
            for to in [Provisioning, Running, Stopping, Stopped, Expired, Error] {
                assert!(!from.can_transition_to(to), "{from:?} -> {to:?}");
            }
        }
        assert!(!Running.can_transition_to(Provisioning));
        assert!(!Stopping.can_transition_to(Running));
    }

    #[test]
    fn status_serializes_in_wire_case() {
        assert_eq!(
            serde_json::to_string(&EnvStatus::Running).unwrap(),
            "\"RUNNING\""
        );
        assert_eq!(
            serde_json::to_string(&EnvStatus::Provisioning).unwrap(),
            "\"PROVISIONING\""
        );
    }

    #[test]
    fn flags_are_unique_and_hashable() {
        let a = generate_flag("web-101");
        let b = generate_flag("web-101");
        assert!(a.starts_with("FLAG{web-101_"));
        assert!(a.ends_with('}'));
        assert_ne!(a, b);
        assert_eq!(sha256_hex(&a).len(), 64);
    }

    #[test]
    fn environment_record_hides_container_name() {
        let (status_tx, _) = watch::channel(EnvStatus::Running);
        drop(status_tx);
        let now = Utc::now();
        let env = Environment {
            instance_id: "env-1".into(),
            challenge_id: "web-101".into(),
            container_name: "ctf-deadbeef".into(),
            status: EnvStatus::Running,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(60),
            ports: PortMap {
                ssh: 30000,
                vscode: 31000,
                desktop: 32000,
            },
            expired: false,
            flag_hash: String::new(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(!json.contains("ctf-deadbeef"));
        assert!(json.contains("\"instanceId\":\"env-1\""));
        assert!(json.contains("\"status\":\"RUNNING\""));
        assert!(json.contains("\"expiresAt\""));
    }
}
