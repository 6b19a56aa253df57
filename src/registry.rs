//! Concurrent registry of live terminal sessions, one per instance at most.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{RelayError, Result};

/// Session lifecycle as seen from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attaching,
    Active,
    Closing,
}

/// Proof of ownership handed out at insertion. Removal requires it, so a
/// stale cleanup path can never evict a successor session that reattached
/// under the same instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken(u64);

struct SessionEntry {
    token: SessionToken,
    state: SessionState,
}

#[derive(Default)]
pub struct SessionRegistry {
    next_token: AtomicU64,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the instance for a new session, in `Attaching` state. Fails when
    /// another session already holds it (second-attach policy: reject new).
    pub fn insert(&self, instance_id: &str) -> Result<SessionToken> {
        let mut sessions = self.sessions.lock();
        if sessions.contains_key(instance_id) {
            return Err(RelayError::AlreadyAttached(instance_id.to_string()));
        }
        let token = SessionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        sessions.insert(
            instance_id.to_string(),
            SessionEntry {
                token,
                state: SessionState::Attaching,
            },
        );
        Ok(token)
    }

    /// Move the owning session's entry to a new state. No-op for a stale
    /// token.
    pub fn set_state(&self, instance_id: &str, token: SessionToken, state: SessionState) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(instance_id) {
            if entry.token == token {
                entry.state = state;
            }
        }
    }

    /// Remove the session entry. Idempotent: removing an absent key, or
    /// holding a stale token, is a no-op returning false.
    pub fn remove(&self, instance_id: &str, token: SessionToken) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(instance_id) {
            Some(entry) if entry.token == token => {
                sessions.remove(instance_id);
                true
            }
            _ => false,
        }
    }

    pub fn state_of(&self, instance_id: &str) -> Option<SessionState> {
        self.sessions.lock().get(instance_id).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_attach_is_rejected() {
        let registry = SessionRegistry::new();
        let _token = registry.insert("env-1").unwrap();
        let err = registry.insert("env-1").unwrap_err();
        assert!(matches!(err, RelayError::AlreadyAttached(_)));
    }

    #[test]
    fn removal_is_idempotent() {
        let registry = SessionRegistry::new();
        let token = registry.insert("env-1").unwrap();
        assert!(registry.remove("env-1", token));
        assert!(!registry.remove("env-1", token));
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_token_cannot_remove_successor() {
        let registry = SessionRegistry::new();
        let old = registry.insert("env-1").unwrap();
        assert!(registry.remove("env-1", old));

        let fresh = registry.insert("env-1").unwrap();
        // A late cleanup from the old session must not evict the new one.
        assert!(!registry.remove("env-1", old));
        assert_eq!(registry.state_of("env-1"), Some(SessionState::Attaching));
        assert!(registry.remove("env-1", fresh));
    }

    #[test]
    fn state_transitions_require_the_owning_token() {
        let registry = SessionRegistry::new();
        let token = registry.insert("env-1").unwrap();
        registry.set_state("env-1", token, SessionState::Active);
        assert_eq!(registry.state_of("env-1"), Some(SessionState::Active));

        let stale = SessionToken(9999);
        registry.set_state("env-1", stale, SessionState::Closing);
        assert_eq!(registry.state_of("env-1"), Some(SessionState::Active));
    }
}
