//! Session Registry: the process-wide name → session mapping.
//!
//! Grounded on `socket::client_conn::SocketClientConn`'s "session owns an
//! outbound channel, a dedicated write task drains it" shape, generalized
//! from one Unix socket per Hub connection to N WebSocket sessions per
//! broker, keyed by claimed user name instead of a generated client id.
//! Uses a plain `std::sync::Mutex<HashMap<..>>` rather than an async
//! mutex: every critical section here is synchronous and non-blocking, so
//! there is never a reason to hold it across an `.await`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::codec::{Presence, BROADCAST};

/// A registered session's record.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    /// Outbound channel into this session's dedicated write task.
    pub outbox: UnboundedSender<Vec<u8>>,
    pub state: Presence,
    pub addr: SocketAddr,
}

/// Outcome of a [`Registry::claim`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    AcceptedNew,
    AcceptedReconnect,
    RejectedInUse,
    RejectedBadName,
}

#[derive(Debug)]
pub struct Registry {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    fn is_valid_name(name: &str) -> bool {
        !name.is_empty() && name.len() <= 255 && name != BROADCAST
    }

    /// Would a claim of `name` succeed right now, without mutating state?
    /// Used by the plain-HTTP name-probe path (no upgrade headers).
    pub fn would_admit(&self, name: &str) -> bool {
        if !Self::is_valid_name(name) {
            return false;
        }
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        match sessions.get(name) {
            None => true,
            Some(record) => record.state == Presence::Disconnected,
        }
    }

    /// Admit `name` into the registry, replacing a disconnected record's
    /// transport if present.
    pub fn claim(&self, name: &str, outbox: UnboundedSender<Vec<u8>>, addr: SocketAddr) -> ClaimOutcome {
        if !Self::is_valid_name(name) {
            return ClaimOutcome::RejectedBadName;
        }
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        match sessions.get_mut(name) {
            None => {
                sessions.insert(name.to_owned(), SessionRecord { outbox, state: Presence::Active, addr });
                ClaimOutcome::AcceptedNew
            }
            Some(record) if record.state == Presence::Disconnected => {
                record.outbox = outbox;
                record.state = Presence::Active;
                record.addr = addr;
                ClaimOutcome::AcceptedReconnect
            }
            Some(_) => ClaimOutcome::RejectedInUse,
        }
    }

    /// Set `name`'s presence state, returning the previous state.
    pub fn set_state(&self, name: &str, new_state: Presence) -> Option<Presence> {
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.get_mut(name).map(|record| std::mem::replace(&mut record.state, new_state))
    }

    /// Mark `name` disconnected. No-op if the name is unregistered.
    pub fn mark_offline(&self, name: &str) {
        let mut sessions = self.sessions.lock().expect("registry mutex poisoned");
        if let Some(record) = sessions.get_mut(name) {
            record.state = Presence::Disconnected;
        }
    }

    /// Current state of `name`, if registered.
    pub fn state_of(&self, name: &str) -> Option<Presence> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.get(name).map(|r| r.state)
    }

    /// A consistent snapshot of every registered (name, state) pair.
    pub fn snapshot(&self) -> Vec<(String, Presence)> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.iter().map(|(name, record)| (name.clone(), record.state)).collect()
    }

    /// Outbox handles for every session currently `Active`, optionally
    /// excluding one name (the sender, for broadcast fan-out).
    pub fn active_outboxes(&self, exclude: Option<&str>) -> Vec<UnboundedSender<Vec<u8>>> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions
            .iter()
            .filter(|(name, record)| record.state == Presence::Active && Some(name.as_str()) != exclude)
            .map(|(_, record)| record.outbox.clone())
            .collect()
    }

    /// Outbox handles for every session with an open transport (any state
    /// except `Disconnected`), optionally excluding one name.
    pub fn open_outboxes(&self, exclude: Option<&str>) -> Vec<UnboundedSender<Vec<u8>>> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions
            .iter()
            .filter(|(name, record)| record.state != Presence::Disconnected && Some(name.as_str()) != exclude)
            .map(|(_, record)| record.outbox.clone())
            .collect()
    }

    /// The outbox handle for a single named session, if registered and
    /// its transport is open.
    pub fn outbox_for(&self, name: &str) -> Option<UnboundedSender<Vec<u8>>> {
        let sessions = self.sessions.lock().expect("registry mutex poisoned");
        sessions.get(name).filter(|r| r.state != Presence::Disconnected).map(|r| r.outbox.clone())
    }

    /// Number of registered names regardless of state. Used for logging
    /// only, never by a wire operation.
    pub fn count(&self) -> usize {
        self.sessions.lock().expect("registry mutex poisoned").len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    fn outbox() -> UnboundedSender<Vec<u8>> {
        tokio::sync::mpsc::unbounded_channel().0
    }

    #[test]
    fn claim_rejects_empty_and_tilde() {
        let reg = Registry::new();
        assert_eq!(reg.claim("", outbox(), addr()), ClaimOutcome::RejectedBadName);
        assert_eq!(reg.claim("~", outbox(), addr()), ClaimOutcome::RejectedBadName);
    }

    #[test]
    fn claim_rejects_names_over_255_bytes() {
        let reg = Registry::new();
        let name = "a".repeat(256);
        assert_eq!(reg.claim(&name, outbox(), addr()), ClaimOutcome::RejectedBadName);
        let name = "a".repeat(255);
        assert_eq!(reg.claim(&name, outbox(), addr()), ClaimOutcome::AcceptedNew);
    }

    #[test]
    fn claim_new_then_in_use() {
        let reg = Registry::new();
        assert_eq!(reg.claim("alice", outbox(), addr()), ClaimOutcome::AcceptedNew);
        assert_eq!(reg.claim("alice", outbox(), addr()), ClaimOutcome::RejectedInUse);
    }

    #[test]
    fn claim_reconnect_after_mark_offline() {
        let reg = Registry::new();
        assert_eq!(reg.claim("alice", outbox(), addr()), ClaimOutcome::AcceptedNew);
        reg.mark_offline("alice");
        assert_eq!(reg.state_of("alice"), Some(Presence::Disconnected));
        assert_eq!(reg.claim("alice", outbox(), addr()), ClaimOutcome::AcceptedReconnect);
        assert_eq!(reg.state_of("alice"), Some(Presence::Active));
    }

    #[test]
    fn would_admit_mirrors_claim_without_mutating() {
        let reg = Registry::new();
        assert!(reg.would_admit("alice"));
        reg.claim("alice", outbox(), addr());
        assert!(!reg.would_admit("alice"));
        assert_eq!(reg.count(), 1, "would_admit must not mutate the registry");
        reg.mark_offline("alice");
        assert!(reg.would_admit("alice"));
    }

    #[test]
    fn set_state_returns_previous() {
        let reg = Registry::new();
        reg.claim("alice", outbox(), addr());
        let prev = reg.set_state("alice", Presence::Busy);
        assert_eq!(prev, Some(Presence::Active));
        assert_eq!(reg.state_of("alice"), Some(Presence::Busy));
    }

    #[test]
    fn active_outboxes_excludes_busy_and_sender() {
        let reg = Registry::new();
        reg.claim("alice", outbox(), addr());
        reg.claim("bob", outbox(), addr());
        reg.claim("carol", outbox(), addr());
        reg.set_state("bob", Presence::Busy);
        let targets = reg.active_outboxes(Some("alice"));
        assert_eq!(targets.len(), 1, "only carol is active and not the sender");
    }

    #[test]
    fn open_outboxes_includes_busy_but_not_disconnected() {
        let reg = Registry::new();
        reg.claim("alice", outbox(), addr());
        reg.claim("bob", outbox(), addr());
        reg.set_state("bob", Presence::Busy);
        reg.claim("carol", outbox(), addr());
        reg.mark_offline("carol");
        let targets = reg.open_outboxes(None);
        assert_eq!(targets.len(), 2, "alice (active) and bob (busy) are open; carol is not");
    }

    #[test]
    fn snapshot_reflects_all_registered_names() {
        let reg = Registry::new();
        reg.claim("alice", outbox(), addr());
        reg.claim("bob", outbox(), addr());
        reg.mark_offline("bob");
        let mut snap = reg.snapshot();
        snap.sort();
        assert_eq!(snap, vec![("alice".to_string(), Presence::Active), ("bob".to_string(), Presence::Disconnected)]);
    }
}
