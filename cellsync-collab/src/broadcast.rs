//! Fan-out of committed operations to every peer of a document room.
//!
//! Uses a tokio broadcast channel so one send reaches all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! commits. The sender receives its own commits too; each connection turns
//! those into acknowledgements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cellsync_core::{Component, ParticipantId};
use tokio::sync::{broadcast, RwLock};

use crate::protocol::ParticipantInfo;

/// One operation committed by the room's authority.
#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub origin: ParticipantId,
    pub version: u64,
    pub ops: Vec<Component>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters kept as atomics so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Commit>>,

    /// Connected peers in this room
    peers: Arc<RwLock<HashMap<ParticipantId, ParticipantInfo>>>,

    /// Commits buffered per receiver before it lags
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: ParticipantInfo) -> broadcast::Receiver<Arc<Commit>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, id: &ParticipantId) -> Option<ParticipantInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(id)
    }

    /// Send a commit to every receiver, the origin included.
    ///
    /// Returns the number of receivers reached.
    pub fn broadcast(&self, commit: Commit) -> usize {
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(Arc::new(commit)) {
            Ok(count) => count,
            Err(_) => {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    /// Record that a receiver fell behind by `n` commits.
    pub fn record_lag(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<ParticipantInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, id: &ParticipantId) -> bool {
        self.peers.read().await.contains_key(id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn commit(origin: ParticipantId, version: u64) -> Commit {
        Commit { origin, version, ops: Vec::new() }
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let peer = ParticipantInfo::new("Alice");
        let id = peer.id;

        let _rx = group.add_peer(peer).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        group.remove_peer(&id).await;
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_origin_and_others() {
        let group = BroadcastGroup::new(16);
        let alice = ParticipantInfo::new("Alice");
        let bob = ParticipantInfo::new("Bob");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(bob).await;

        assert_eq!(group.broadcast(commit(alice.id, 1)), 2);

        let seen1 = rx1.recv().await.unwrap();
        let seen2 = rx2.recv().await.unwrap();
        assert_eq!(seen1.origin, alice.id);
        assert!(Arc::ptr_eq(&seen1, &seen2));
    }

    #[tokio::test]
    async fn test_commits_arrive_in_order() {
        let group = BroadcastGroup::new(16);
        let mut rx = group.add_peer(ParticipantInfo::new("Alice")).await;
        let origin = Uuid::new_v4();
        for version in 1..=5 {
            group.broadcast(commit(origin, version));
        }
        for version in 1..=5 {
            assert_eq!(rx.recv().await.unwrap().version, version);
        }
    }

    #[tokio::test]
    async fn test_broadcast_without_receivers_counts_drop() {
        let group = BroadcastGroup::new(4);
        assert_eq!(group.broadcast(commit(Uuid::new_v4(), 1)), 0);
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let mut rx = group.add_peer(ParticipantInfo::new("Slow")).await;
        let origin = Uuid::new_v4();
        for version in 1..=4 {
            group.broadcast(commit(origin, version));
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(ParticipantInfo::new("Alice")).await;
        let _rx2 = group.add_peer(ParticipantInfo::new("Bob")).await;

        let peers = group.peers().await;
        let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
        assert_eq!(group.capacity(), 16);
    }
}
