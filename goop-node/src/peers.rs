//! Soft-state peer table.
//!
//! A map from PeerID to the advisory state we hold about that peer, plus a
//! set of bounded listener queues. Entries move online → offline → pruned
//! under TTL/grace cutoffs; a peer that has been pruned no longer exists.
//!
//! Event emission is serialised under the table lock. A full listener queue
//! drops the event for that listener only — producers never block.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Capacity of each listener queue.
const LISTENER_CAPACITY: usize = 256;

/// Opaque, totally orderable peer identifier produced by the substrate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Advisory fields copied from presence announcements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerProfile {
    pub content: String,
    pub email: String,
    pub avatar_hash: String,
    pub video_disabled: bool,
    pub active_template: String,
    pub verified: bool,
}

/// Everything the node keeps about another peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeenPeer {
    pub id: PeerId,
    #[serde(flatten)]
    pub profile: PeerProfile,
    /// An entangled stream to the peer is currently up.
    pub reachable: bool,
    /// `None` means currently online.
    pub offline_since: Option<SystemTime>,
    pub last_seen: SystemTime,
}

impl SeenPeer {
    /// A peer is online iff it has no offline timestamp.
    pub fn is_online(&self) -> bool {
        self.offline_since.is_none()
    }
}

/// Events delivered to table listeners.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Entry created or changed; carries the post-change state.
    Update(SeenPeer),
    /// Entry pruned from the table.
    Remove(PeerId),
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<PeerEvent>,
}

struct Inner {
    peers: HashMap<PeerId, SeenPeer>,
    listeners: Vec<Listener>,
    next_listener_id: u64,
}

/// Handle for unsubscribing a listener.
pub struct ListenerHandle {
    id: u64,
    table: PeerTable,
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.table
            .inner
            .lock()
            .listeners
            .retain(|l| l.id != self.id);
    }
}

#[derive(Clone)]
pub struct PeerTable {
    inner: Arc<Mutex<Inner>>,
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peers: HashMap::new(),
                listeners: Vec::new(),
                next_listener_id: 0,
            })),
        }
    }

    /// Create or update an entry from an announcement, reactivating offline
    /// entries. `reachable` is preserved for entries that were already online.
    pub fn upsert(&self, id: &PeerId, profile: PeerProfile) {
        let mut inner = self.inner.lock();
        let now = SystemTime::now();
        let peer = match inner.peers.get_mut(id) {
            Some(existing) => {
                existing.profile = profile;
                if !existing.is_online() {
                    // Reactivation: a fresh announcement brings the peer back.
                    existing.reachable = true;
                    existing.offline_since = None;
                }
                existing.last_seen = now;
                existing.clone()
            }
            None => {
                let peer = SeenPeer {
                    id: id.clone(),
                    profile,
                    reachable: true,
                    offline_since: None,
                    last_seen: now,
                };
                inner.peers.insert(id.clone(), peer.clone());
                peer
            }
        };
        Self::emit(&mut inner, PeerEvent::Update(peer));
    }

    /// Insert-if-absent, initialising the entry as offline. Used to surface
    /// peers learned from storage or rendezvous before they have announced.
    pub fn seed(&self, id: &PeerId, profile: PeerProfile) {
        let mut inner = self.inner.lock();
        if inner.peers.contains_key(id) {
            return;
        }
        let now = SystemTime::now();
        let peer = SeenPeer {
            id: id.clone(),
            profile,
            reachable: false,
            offline_since: Some(now),
            last_seen: now,
        };
        inner.peers.insert(id.clone(), peer.clone());
        Self::emit(&mut inner, PeerEvent::Update(peer));
    }

    /// Refresh `last_seen` only. No event.
    pub fn touch(&self, id: &PeerId) {
        if let Some(peer) = self.inner.lock().peers.get_mut(id) {
            peer.last_seen = SystemTime::now();
        }
    }

    /// Transition an online entry to offline. Idempotent.
    pub fn mark_offline(&self, id: &PeerId) {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peers.get_mut(id) else {
            return;
        };
        if !peer.is_online() {
            return;
        }
        peer.reachable = false;
        peer.offline_since = Some(SystemTime::now());
        let snapshot = peer.clone();
        Self::emit(&mut inner, PeerEvent::Update(snapshot));
    }

    /// Flip the entangled-stream flag. No-op (and no event) when unchanged.
    pub fn set_reachable(&self, id: &PeerId, reachable: bool) {
        let mut inner = self.inner.lock();
        let Some(peer) = inner.peers.get_mut(id) else {
            return;
        };
        if peer.reachable == reachable {
            return;
        }
        peer.reachable = reachable;
        let snapshot = peer.clone();
        Self::emit(&mut inner, PeerEvent::Update(snapshot));
    }

    /// TTL/grace sweep. Online entries not seen since `ttl_cutoff` go
    /// offline; offline entries whose `offline_since` predates `grace_cutoff`
    /// are removed.
    pub fn prune_stale(&self, ttl_cutoff: SystemTime, grace_cutoff: SystemTime) {
        let mut inner = self.inner.lock();
        let mut events = Vec::new();
        inner.peers.retain(|id, peer| {
            if peer.is_online() {
                if peer.last_seen < ttl_cutoff {
                    peer.reachable = false;
                    peer.offline_since = Some(SystemTime::now());
                    events.push(PeerEvent::Update(peer.clone()));
                }
                true
            } else if peer.offline_since.is_some_and(|t| t < grace_cutoff) {
                events.push(PeerEvent::Remove(id.clone()));
                false
            } else {
                true
            }
        });
        for ev in events {
            Self::emit(&mut inner, ev);
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<SeenPeer> {
        self.inner.lock().peers.get(id).cloned()
    }

    /// Independent copy of the table.
    pub fn snapshot(&self) -> Vec<SeenPeer> {
        let mut peers: Vec<_> = self.inner.lock().peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    /// Ids of peers currently online.
    pub fn online_ids(&self) -> Vec<PeerId> {
        self.inner
            .lock()
            .peers
            .values()
            .filter(|p| p.is_online())
            .map(|p| p.id.clone())
            .collect()
    }

    /// Register a bounded listener queue. Dropping the handle unsubscribes.
    pub fn subscribe(&self) -> (ListenerHandle, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        let mut inner = self.inner.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.push(Listener { id, tx });
        (
            ListenerHandle {
                id,
                table: self.clone(),
            },
            rx,
        )
    }

    fn emit(inner: &mut Inner, event: PeerEvent) {
        inner.listeners.retain(|l| {
            match l.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Drop for this listener only; others still get the event.
                    tracing::debug!(listener = l.id, "peer event dropped: listener queue full");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn profile(content: &str) -> PeerProfile {
        PeerProfile {
            content: content.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_creates_online_entry() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("alice"));
        let peer = table.get(&id).unwrap();
        assert!(peer.is_online());
        assert!(peer.reachable);
        assert_eq!(peer.profile.content, "alice");
    }

    #[test]
    fn seed_initialises_offline_and_does_not_overwrite() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.seed(&id, profile("seeded"));
        assert!(!table.get(&id).unwrap().is_online());

        table.upsert(&id, profile("announced"));
        let peer = table.get(&id).unwrap();
        assert!(peer.is_online());
        assert!(peer.reachable, "reactivation restores reachable");

        // seeding an existing entry is a no-op
        table.seed(&id, profile("ignored"));
        assert_eq!(table.get(&id).unwrap().profile.content, "announced");
    }

    #[test]
    fn upsert_preserves_reachable_when_online() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("a"));
        table.set_reachable(&id, false);
        table.upsert(&id, profile("a2"));
        let peer = table.get(&id).unwrap();
        assert!(peer.is_online());
        assert!(!peer.reachable, "online upsert must not flip reachable");
    }

    #[test]
    fn mark_offline_is_idempotent() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("a"));
        let (_h, mut rx) = table.subscribe();

        table.mark_offline(&id);
        table.mark_offline(&id);

        let ev = rx.try_recv().unwrap();
        match ev {
            PeerEvent::Update(p) => {
                assert!(!p.reachable);
                assert!(p.offline_since.is_some());
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "second mark_offline emits nothing");
    }

    #[test]
    fn set_reachable_emits_only_on_change() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("a"));
        let (_h, mut rx) = table.subscribe();

        table.set_reachable(&id, true); // already true
        assert!(rx.try_recv().is_err());

        table.set_reachable(&id, false);
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Update(_))));
    }

    #[test]
    fn prune_offline_then_remove() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("a"));
        let (_h, mut rx) = table.subscribe();

        // TTL expiry: last_seen is before a future cutoff → goes offline
        let future = SystemTime::now() + Duration::from_secs(1);
        table.prune_stale(future, SystemTime::now() - Duration::from_secs(3600));
        assert!(!table.get(&id).unwrap().is_online());
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Update(_))));

        // Grace expiry: offline_since before a future cutoff → removed
        let future = SystemTime::now() + Duration::from_secs(1);
        table.prune_stale(SystemTime::now() - Duration::from_secs(3600), future);
        assert!(table.get(&id).is_none());
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Remove(_))));
    }

    #[test]
    fn touch_defers_ttl_expiry() {
        let table = PeerTable::new();
        let id = PeerId::from("peer-a");
        table.upsert(&id, profile("a"));
        std::thread::sleep(Duration::from_millis(20));
        table.touch(&id);
        // Cutoff between upsert and touch: entry stays online
        let cutoff = SystemTime::now() - Duration::from_millis(10);
        table.prune_stale(cutoff, SystemTime::now() - Duration::from_secs(3600));
        assert!(table.get(&id).unwrap().is_online());
    }

    #[test]
    fn full_listener_drops_without_blocking() {
        let table = PeerTable::new();
        let (_h, mut rx) = table.subscribe();
        let id = PeerId::from("peer-a");
        // More events than LISTENER_CAPACITY; must not deadlock or panic
        for i in 0..(LISTENER_CAPACITY + 50) {
            table.upsert(&id, profile(&format!("v{i}")));
        }
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, LISTENER_CAPACITY);
    }

    #[test]
    fn snapshot_is_independent() {
        let table = PeerTable::new();
        table.upsert(&PeerId::from("b"), profile("b"));
        table.upsert(&PeerId::from("a"), profile("a"));
        let snap = table.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap[0].id < snap[1].id);
        table.mark_offline(&PeerId::from("a"));
        assert!(snap[0].is_online(), "snapshot unaffected by later mutation");
    }
}
