//! Active-call registry
//!
//! Shared map from channel id to the session's control queue, used by
//! the ARI event router, the admin hangup endpoint and the call gauge.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::events::ControlMsg;

/// One registered session
#[derive(Clone)]
pub struct SessionEntry {
    pub control: mpsc::Sender<ControlMsg>,
}

/// Process-wide registry of live calls
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, channel_id: &str, control: mpsc::Sender<ControlMsg>) {
        self.sessions
            .insert(channel_id.to_string(), SessionEntry { control });
    }

    pub fn remove(&self, channel_id: &str) {
        self.sessions.remove(channel_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains(&self, channel_id: &str) -> bool {
        self.sessions.contains_key(channel_id)
    }

    /// Deliver a message to one session; false when it is gone
    pub fn send(&self, channel_id: &str, msg: ControlMsg) -> bool {
        match self.sessions.get(channel_id) {
            Some(entry) => entry.control.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Deliver a message to every session (ARI up/down edges)
    pub fn broadcast_with(&self, make: impl Fn() -> ControlMsg) {
        for entry in self.sessions.iter() {
            let _ = entry.value().control.try_send(make());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registry_routes_and_counts() {
        let registry = SessionRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.insert("ch-1", tx);
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("ch-1"));

        assert!(registry.send("ch-1", ControlMsg::ForceHangup));
        assert!(matches!(rx.recv().await, Some(ControlMsg::ForceHangup)));
        assert!(!registry.send("ch-2", ControlMsg::ForceHangup));

        registry.remove("ch-1");
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_session() {
        let registry = SessionRegistry::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        registry.insert("a", tx_a);
        registry.insert("b", tx_b);

        registry.broadcast_with(|| ControlMsg::AriDown);
        assert!(matches!(rx_a.recv().await, Some(ControlMsg::AriDown)));
        assert!(matches!(rx_b.recv().await, Some(ControlMsg::AriDown)));
    }
}
