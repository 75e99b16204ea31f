//! Group manager: host-relayed multi-member channels.
//!
//! Every node plays both roles at once — *host* for the groups it owns and
//! *client* for the groups it joined elsewhere. The host relays application
//! messages between members over per-member bounded queues; clients keep one
//! long-lived stream to the host and a persisted subscription so they can
//! reconnect after a restart.
//!
//! `volatile` is a single policy switch: it controls same-app-type eviction
//! on create/invite, skips member-list persistence, and (for the
//! distinguished `realtime` app type) enables auto-join on invite. The wire
//! never explains this coupling; it lives here.
//!
//! Streams are owned by the manager. Members and client connections hold
//! only identifiers and queues; everything cross-references through the
//! manager's maps, never through object handles.

mod client;
mod host;
mod invite;
pub mod wire;

pub use invite::Invite;
pub use wire::GroupMsg;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::db::Db;
use crate::error::{Error, Result};
use crate::msgid;
use crate::peers::PeerId;
use crate::substrate::{IncomingConn, Substrate};

/// Per-member send queue capacity. A slow member drops relays, never blocks.
pub const MEMBER_QUEUE_CAPACITY: usize = 64;
/// Hard cap on concurrently hosted non-volatile groups.
pub const MAX_HOSTED_GROUPS: usize = 50;
/// The app type whose invites auto-join.
pub const REALTIME_APP_TYPE: &str = "realtime";
/// Discovery grace before reconnecting persisted subscriptions at startup.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(10);

/// Capacity of each group event listener queue.
const LISTENER_CAPACITY: usize = 256;

/// Wire timing knobs, overridable in tests.
#[derive(Debug, Clone, Copy)]
pub struct GroupTiming {
    /// Write deadline for one queued record.
    pub write_deadline: Duration,
    /// Host → member ping cadence.
    pub ping_interval: Duration,
    /// Host disconnects a member with no pong for this long; clients use the
    /// same value as their refreshing read deadline.
    pub pong_deadline: Duration,
    /// How long the host waits for the initial `join` record.
    pub first_record_timeout: Duration,
    /// How long a client waits for `welcome`.
    pub welcome_timeout: Duration,
}

impl Default for GroupTiming {
    fn default() -> Self {
        Self {
            write_deadline: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            pong_deadline: Duration::from_secs(75),
            first_record_timeout: Duration::from_secs(30),
            welcome_timeout: Duration::from_secs(10),
        }
    }
}

/// Persistent description of a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    pub name: String,
    pub app_type: String,
    /// 0 = unlimited.
    pub max_members: u32,
    pub volatile: bool,
    pub host_joined: bool,
    pub created_at: u64,
}

/// Client-side record of a group joined elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub host: PeerId,
    pub group_id: String,
    pub name: String,
    pub app_type: String,
    pub volatile: bool,
    pub role: String,
}

/// Events fanned out to group listeners.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    /// A group was created locally.
    Created { info: GroupInfo },
    /// An invite arrived; its subscription is already persisted.
    Invited { subscription: Subscription },
    /// A remote group was joined (client side).
    Joined { group_id: String },
    /// Membership of a group changed.
    Members { group_id: String, members: Vec<String> },
    /// Metadata of a subscribed group changed.
    Meta {
        group_id: String,
        name: String,
        app_type: String,
        max_members: u32,
    },
    /// Application payload, hosted or subscribed.
    Message {
        group_id: String,
        from: String,
        payload: serde_json::Value,
        /// True for `state` records.
        state: bool,
    },
    /// A hosted group closed or a subscribed group went away.
    Closed { group_id: String },
}

struct GroupListener {
    id: u64,
    tx: mpsc::Sender<GroupEvent>,
}

/// Handle for a group event listener; dropping it unsubscribes.
pub struct GroupListenerHandle {
    id: u64,
    manager: Arc<GroupManager>,
}

impl Drop for GroupListenerHandle {
    fn drop(&mut self) {
        self.manager.listeners.lock().retain(|l| l.id != self.id);
    }
}

pub struct GroupManager {
    local_id: PeerId,
    substrate: OnceLock<Arc<Substrate>>,
    db: Arc<parking_lot::Mutex<Db>>,
    pub(crate) hosted: parking_lot::Mutex<HashMap<String, host::HostedGroup>>,
    pub(crate) active: tokio::sync::Mutex<HashMap<String, client::ActiveGroup>>,
    listeners: parking_lot::Mutex<Vec<GroupListener>>,
    next_listener_id: std::sync::atomic::AtomicU64,
    pub(crate) timing: GroupTiming,
}

impl GroupManager {
    pub fn new(local_id: PeerId, db: Arc<parking_lot::Mutex<Db>>) -> Arc<Self> {
        Self::with_timing(local_id, db, GroupTiming::default())
    }

    pub fn with_timing(
        local_id: PeerId,
        db: Arc<parking_lot::Mutex<Db>>,
        timing: GroupTiming,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_id,
            substrate: OnceLock::new(),
            db,
            hosted: parking_lot::Mutex::new(HashMap::new()),
            active: tokio::sync::Mutex::new(HashMap::new()),
            listeners: parking_lot::Mutex::new(Vec::new()),
            next_listener_id: std::sync::atomic::AtomicU64::new(0),
            timing,
        })
    }

    /// Attach the transport. Dials fail with `Closed` until this runs.
    pub fn bind_substrate(&self, substrate: Arc<Substrate>) {
        let _ = self.substrate.set(substrate);
    }

    pub(crate) fn substrate(&self) -> Result<&Arc<Substrate>> {
        self.substrate
            .get()
            .ok_or_else(|| Error::Closed("group manager has no transport".into()))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub(crate) fn db(&self) -> &Arc<parking_lot::Mutex<Db>> {
        &self.db
    }

    /// Re-create hosted groups persisted by a previous run (empty member
    /// lists; members rejoin on their own).
    pub fn restore_hosted(&self) {
        let groups = match self.db.lock().load_groups() {
            Ok(groups) => groups,
            Err(e) => {
                tracing::warn!("failed to load persisted groups: {e}");
                return;
            }
        };
        let mut hosted = self.hosted.lock();
        for info in groups {
            tracing::info!(group = %info.id, name = %info.name, "restored hosted group");
            hosted
                .entry(info.id.clone())
                .or_insert_with(|| host::HostedGroup::new(info));
        }
    }

    /// Register a bounded event listener. Full queues drop events for that
    /// listener only.
    pub fn subscribe(self: &Arc<Self>) -> (GroupListenerHandle, mpsc::Receiver<GroupEvent>) {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        let id = self
            .next_listener_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.listeners.lock().push(GroupListener { id, tx });
        (
            GroupListenerHandle {
                id,
                manager: Arc::clone(self),
            },
            rx,
        )
    }

    pub(crate) fn emit(&self, event: GroupEvent) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| match l.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(listener = l.id, "group event dropped: listener queue full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Create a hosted group. A volatile group first evicts every other
    /// group of the same app type on this node.
    pub async fn create_group(
        self: &Arc<Self>,
        name: impl Into<String>,
        app_type: impl Into<String>,
        max_members: u32,
        volatile: bool,
    ) -> Result<GroupInfo> {
        let name = name.into();
        let app_type = app_type.into();
        if volatile {
            self.evict_app_type(&app_type).await;
        }

        let info = GroupInfo {
            id: msgid::generate().to_lowercase(),
            name,
            app_type,
            max_members,
            volatile,
            host_joined: true,
            created_at: now_secs(),
        };
        {
            let mut hosted = self.hosted.lock();
            if !volatile {
                let persistent = hosted.values().filter(|g| !g.info.volatile).count();
                if persistent >= MAX_HOSTED_GROUPS {
                    return Err(Error::Full(format!(
                        "hosting limit of {MAX_HOSTED_GROUPS} non-volatile groups reached"
                    )));
                }
            }
            hosted.insert(info.id.clone(), host::HostedGroup::new(info.clone()));
        }
        if !volatile {
            if let Err(e) = self.db.lock().save_group(&info) {
                tracing::warn!(group = %info.id, "failed to persist group: {e}");
            }
        }
        tracing::info!(group = %info.id, name = %info.name, volatile, "group created");
        self.emit(GroupEvent::Created { info: info.clone() });
        Ok(info)
    }

    /// Close a hosted group: notify members (best-effort), drop their
    /// queues, and delete the persisted record.
    pub fn close_group(&self, group_id: &str) -> Result<()> {
        let group = self
            .hosted
            .lock()
            .remove(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
        for (peer, member) in &group.members {
            // Encode/enqueue failures are ignored: the member is about to see
            // its stream close anyway.
            let _ = member.tx.try_send(GroupMsg::Close {
                group: group_id.to_string(),
            });
            tracing::debug!(group = group_id, peer = %peer, "member notified of close");
        }
        if !group.info.volatile {
            if let Err(e) = self.db.lock().delete_group(group_id) {
                tracing::warn!(group = group_id, "failed to delete persisted group: {e}");
            }
        }
        tracing::info!(group = group_id, "group closed");
        self.emit(GroupEvent::Closed {
            group_id: group_id.to_string(),
        });
        Ok(())
    }

    /// Toggle the host's own membership in a hosted group.
    pub fn set_host_joined(&self, group_id: &str, joined: bool) -> Result<()> {
        let info = {
            let mut hosted = self.hosted.lock();
            let group = hosted
                .get_mut(group_id)
                .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
            if group.info.host_joined == joined {
                return Ok(());
            }
            group.info.host_joined = joined;
            group.host_joined_at = joined.then(now_secs);
            group.info.clone()
        };
        if !info.volatile {
            if let Err(e) = self.db.lock().save_group(&info) {
                tracing::warn!(group = group_id, "failed to persist group: {e}");
            }
        }
        self.broadcast_members(group_id);
        Ok(())
    }

    /// Close/leave every group of `app_type` on this node; the volatile
    /// same-type replacement rule.
    pub(crate) async fn evict_app_type(self: &Arc<Self>, app_type: &str) {
        let hosted_ids: Vec<String> = self
            .hosted
            .lock()
            .values()
            .filter(|g| g.info.app_type == app_type)
            .map(|g| g.info.id.clone())
            .collect();
        for id in hosted_ids {
            tracing::info!(group = %id, app_type, "evicting hosted group of same app type");
            let _ = self.close_group(&id);
        }

        let subscribed_ids: Vec<String> = self
            .active
            .lock()
            .await
            .values()
            .filter(|a| a.sub.app_type == app_type)
            .map(|a| a.sub.group_id.clone())
            .collect();
        for id in subscribed_ids {
            tracing::info!(group = %id, app_type, "leaving subscribed group of same app type");
            let _ = self.unsubscribe(&id).await;
        }
    }

    // ── Sending ────────────────────────────────────────────────────────

    /// Send an application payload into a group, hosted or subscribed.
    pub async fn send_to_group(
        self: &Arc<Self>,
        group_id: &str,
        payload: serde_json::Value,
        state: bool,
    ) -> Result<()> {
        if self.hosted.lock().contains_key(group_id) {
            return self.host_send(group_id, payload, state);
        }
        self.client_send(group_id, payload, state).await
    }

    // ── Snapshots (read-only, for the viewer) ──────────────────────────

    /// Hosted groups with their current member lists.
    pub fn hosted_snapshot(&self) -> Vec<(GroupInfo, Vec<String>)> {
        self.hosted
            .lock()
            .values()
            .map(|g| (g.info.clone(), g.member_list(&self.local_id)))
            .collect()
    }

    /// Subscriptions with a live connection right now.
    pub async fn active_snapshot(&self) -> Vec<Subscription> {
        self.active
            .lock()
            .await
            .values()
            .map(|a| a.sub.clone())
            .collect()
    }

    /// All persisted subscriptions (connected or not).
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.db.lock().load_subscriptions().unwrap_or_default()
    }

    // ── Incoming connections ───────────────────────────────────────────

    /// Route an accepted group-protocol connection to the host side.
    pub async fn handle_group_conn(self: &Arc<Self>, incoming: IncomingConn) {
        let remote = incoming.remote.clone();
        match crate::substrate::accept_stream(&incoming.conn).await {
            Ok(pair) => {
                self.host_handle_stream(remote, pair.recv, pair.send).await;
            }
            Err(e) => tracing::debug!(peer = %remote, "group accept failed: {e}"),
        }
    }

    /// Drop every hosted member queue and leave every subscribed group.
    pub async fn shutdown(self: &Arc<Self>) {
        let hosted_ids: Vec<String> = self.hosted.lock().keys().cloned().collect();
        for id in hosted_ids {
            if let Some(group) = self.hosted.lock().remove(&id) {
                for member in group.members.values() {
                    let _ = member.tx.try_send(GroupMsg::Close { group: id.clone() });
                }
            }
        }
        let mut active = self.active.lock().await;
        for (id, conn) in active.drain() {
            let _ = conn.tx.try_send(GroupMsg::Leave { group: id });
            conn.task.abort();
        }
    }
}

pub(crate) fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
pub(crate) fn test_manager() -> Arc<GroupManager> {
    test_manager_with_id("peer-host")
}

#[cfg(test)]
pub(crate) fn test_manager_with_id(id: &str) -> Arc<GroupManager> {
    let db = Arc::new(parking_lot::Mutex::new(Db::open_memory().unwrap()));
    GroupManager::with_timing(
        PeerId::from(id),
        db,
        GroupTiming {
            write_deadline: Duration::from_secs(1),
            ping_interval: Duration::from_millis(50),
            pong_deadline: Duration::from_millis(400),
            first_record_timeout: Duration::from_secs(2),
            welcome_timeout: Duration::from_secs(2),
        },
    )
}

#[cfg(test)]
mod manager_tests {
    use super::*;

    #[tokio::test]
    async fn create_persists_non_volatile_only() {
        let mgr = test_manager();
        let g1 = mgr.create_group("kept", "chat", 0, false).await.unwrap();
        let g2 = mgr.create_group("session", "game", 0, true).await.unwrap();

        let persisted = mgr.db().lock().load_groups().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, g1.id);
        assert!(mgr.hosted.lock().contains_key(&g2.id), "volatile group is live");
    }

    #[tokio::test]
    async fn volatile_create_evicts_same_app_type() {
        let mgr = test_manager();
        let old = mgr.create_group("old session", "game", 0, true).await.unwrap();
        let unrelated = mgr.create_group("board", "board", 0, false).await.unwrap();

        let new = mgr.create_group("new session", "game", 0, true).await.unwrap();

        let hosted = mgr.hosted.lock();
        assert!(!hosted.contains_key(&old.id), "same-type group evicted");
        assert!(hosted.contains_key(&new.id));
        assert!(hosted.contains_key(&unrelated.id), "other app types untouched");
    }

    #[tokio::test]
    async fn hosting_cap_applies_to_non_volatile_groups() {
        let mgr = test_manager();
        for i in 0..MAX_HOSTED_GROUPS {
            mgr.create_group(format!("g{i}"), "chat", 0, false)
                .await
                .unwrap();
        }
        let err = mgr
            .create_group("one too many", "chat", 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Full(_)), "{err}");
        // volatile groups are not limited by the cap
        mgr.create_group("session", "game", 0, true).await.unwrap();
    }

    #[tokio::test]
    async fn close_group_removes_persisted_record() {
        let mgr = test_manager();
        let info = mgr.create_group("g", "chat", 0, false).await.unwrap();
        mgr.close_group(&info.id).unwrap();
        assert!(mgr.db().lock().load_groups().unwrap().is_empty());
        assert!(matches!(
            mgr.close_group(&info.id),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn restore_hosted_rebuilds_empty_groups() {
        let mgr = test_manager();
        let info = mgr.create_group("g", "chat", 3, false).await.unwrap();
        mgr.hosted.lock().clear(); // simulate restart
        mgr.restore_hosted();
        let hosted = mgr.hosted.lock();
        let group = hosted.get(&info.id).unwrap();
        assert_eq!(group.info.name, "g");
        assert!(group.members.is_empty());
    }

    #[tokio::test]
    async fn events_reach_listeners() {
        let mgr = test_manager();
        let (_handle, mut rx) = mgr.subscribe();
        mgr.create_group("g", "chat", 0, false).await.unwrap();
        match rx.try_recv().unwrap() {
            GroupEvent::Created { info } => assert_eq!(info.name, "g"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
