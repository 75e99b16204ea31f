//! Host side: serve member streams, relay traffic, keep members honest.
//!
//! Each member gets a bounded send queue drained by its own writer task and
//! a ping task that disconnects it when pongs stop. The reading task (the
//! stream handler itself) relays `msg`/`state` records to every other
//! member. Relays are try-send: a slow member loses deliveries, the group
//! never stalls.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::wire::{GroupMsg, ERR_FULL, ERR_NOT_FOUND, ERR_PROTOCOL};
use super::{now_secs, GroupEvent, GroupInfo, GroupManager, MEMBER_QUEUE_CAPACITY};
use crate::error::Result;
use crate::peers::PeerId;

/// Distinguishes a member entry from its replacement after a rejoin.
static MEMBER_GEN: AtomicU64 = AtomicU64::new(0);

pub(crate) struct HostedGroup {
    pub info: GroupInfo,
    pub members: HashMap<PeerId, MemberEntry>,
    pub host_joined_at: Option<u64>,
}

impl HostedGroup {
    pub fn new(info: GroupInfo) -> Self {
        let host_joined_at = info.host_joined.then(now_secs);
        Self {
            info,
            members: HashMap::new(),
            host_joined_at,
        }
    }

    /// Current member ids, host first when joined, the rest sorted.
    pub fn member_list(&self, local_id: &PeerId) -> Vec<String> {
        let mut list: Vec<String> = self.members.keys().map(|p| p.0.clone()).collect();
        list.sort();
        if self.info.host_joined {
            list.insert(0, local_id.0.clone());
        }
        list
    }

    /// peer → joined_at, including the host when joined. This is what gets
    /// persisted for offline browsing.
    fn member_stamps(&self, local_id: &PeerId) -> HashMap<PeerId, u64> {
        let mut stamps: HashMap<PeerId, u64> = self
            .members
            .iter()
            .map(|(p, m)| (p.clone(), m.joined_at))
            .collect();
        if let Some(at) = self.host_joined_at {
            stamps.insert(local_id.clone(), at);
        }
        stamps
    }
}

pub(crate) struct MemberEntry {
    pub joined_at: u64,
    pub tx: mpsc::Sender<GroupMsg>,
    pub last_pong: Arc<parking_lot::Mutex<Instant>>,
    pub gen: u64,
}

enum JoinOutcome {
    Accepted {
        rx: mpsc::Receiver<GroupMsg>,
        gen: u64,
    },
    Rejected(GroupMsg),
}

impl GroupManager {
    /// Serve one member stream from `remote`, from first record to
    /// disconnect. Generic over the stream halves so tests can drive it over
    /// an in-process duplex.
    pub(crate) async fn host_handle_stream<R, W>(self: &Arc<Self>, remote: PeerId, recv: R, send: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let timing = self.timing;
        let mut send = send;
        let mut lines = BufReader::new(recv).lines();

        // First record must be a join for a group we host.
        let first = match tokio::time::timeout(timing.first_record_timeout, lines.next_line()).await
        {
            Ok(Ok(Some(line))) => line,
            _ => return, // silent reset: nothing to answer
        };
        let group_id = match serde_json::from_str::<GroupMsg>(&first) {
            Ok(GroupMsg::Join { group }) => group,
            _ => {
                let reject = GroupMsg::Error {
                    code: ERR_PROTOCOL.into(),
                    message: "expected a join record".into(),
                };
                let _ = write_record(&mut send, &reject, timing.write_deadline).await;
                return;
            }
        };

        let outcome = self.register_member(&group_id, &remote);
        let (mut rx, gen) = match outcome {
            JoinOutcome::Accepted { rx, gen } => (rx, gen),
            JoinOutcome::Rejected(reject) => {
                tracing::debug!(group = %group_id, peer = %remote, "join rejected");
                let _ = write_record(&mut send, &reject, timing.write_deadline).await;
                return;
            }
        };
        tracing::info!(group = %group_id, peer = %remote, "member joined");

        // Drain task: owns the write half for the member's lifetime. The
        // welcome was enqueued under the admission lock, so it is always the
        // first record the member receives.
        let drain_mgr = Arc::clone(self);
        let drain_group = group_id.clone();
        let drain_peer = remote.clone();
        let drain = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write_record(&mut send, &msg, timing.write_deadline)
                    .await
                    .is_err()
                {
                    tracing::debug!(group = %drain_group, peer = %drain_peer, "member write failed");
                    drain_mgr.remove_member(&drain_group, &drain_peer, gen);
                    break;
                }
            }
            // Queue closed or write failed either way: stream ends here.
        });

        // Ping task: cadence pings, pong-deadline enforcement.
        let ping_mgr = Arc::clone(self);
        let ping_group = group_id.clone();
        let ping_peer = remote.clone();
        let ping = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timing.ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // skip the immediate first tick
            loop {
                ticker.tick().await;
                let Some((tx, last_pong)) = ping_mgr.member_channel(&ping_group, &ping_peer, gen)
                else {
                    break; // member already gone
                };
                if last_pong.lock().elapsed() > timing.pong_deadline {
                    tracing::info!(group = %ping_group, peer = %ping_peer, "member pong deadline exceeded");
                    ping_mgr.remove_member(&ping_group, &ping_peer, gen);
                    break;
                }
                let _ = tx.try_send(GroupMsg::Ping {});
            }
        });

        self.broadcast_members(&group_id);

        // Read loop: leave/pong/relay until the stream dies.
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                _ => break,
            };
            let msg = match serde_json::from_str::<GroupMsg>(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(group = %group_id, peer = %remote, "bad group record: {e}");
                    break; // protocol violation resets this stream only
                }
            };
            match msg {
                GroupMsg::Leave { .. } => break,
                GroupMsg::Pong {} => self.stamp_pong(&group_id, &remote, gen),
                GroupMsg::Ping {} => {
                    if let Some((tx, _)) = self.member_channel(&group_id, &remote, gen) {
                        let _ = tx.try_send(GroupMsg::Pong {});
                    }
                }
                GroupMsg::Msg { from, payload, .. } => {
                    if from != remote.as_str() {
                        tracing::warn!(group = %group_id, peer = %remote, claimed = %from, "relay sender mismatch");
                        break;
                    }
                    self.relay(&group_id, &remote, payload, false);
                }
                GroupMsg::State { from, payload, .. } => {
                    if from != remote.as_str() {
                        tracing::warn!(group = %group_id, peer = %remote, claimed = %from, "relay sender mismatch");
                        break;
                    }
                    self.relay(&group_id, &remote, payload, true);
                }
                other => {
                    tracing::debug!(group = %group_id, peer = %remote, "ignoring {other:?}");
                }
            }
        }

        ping.abort();
        self.remove_member(&group_id, &remote, gen);
        // Dropping the member entry closed its queue; the drain task ends on
        // its own once the remaining records are written.
        let _ = drain.await;
        tracing::info!(group = %group_id, peer = %remote, "member stream ended");
    }

    /// Validate a join and insert the member entry. Admission and the
    /// welcome enqueue happen under one lock, so no relay can reach the new
    /// member's queue ahead of the welcome.
    fn register_member(&self, group_id: &str, remote: &PeerId) -> JoinOutcome {
        let mut hosted = self.hosted.lock();
        let Some(group) = hosted.get_mut(group_id) else {
            return JoinOutcome::Rejected(GroupMsg::Error {
                code: ERR_NOT_FOUND.into(),
                message: format!("no such group: {group_id}"),
            });
        };

        // A rejoin from the same peer replaces the stale entry; capacity is
        // checked against everyone else.
        group.members.remove(remote);
        if group.info.max_members > 0 && group.members.len() as u32 >= group.info.max_members {
            return JoinOutcome::Rejected(GroupMsg::Error {
                code: ERR_FULL.into(),
                message: "group is full".into(),
            });
        }

        let (tx, rx) = mpsc::channel(MEMBER_QUEUE_CAPACITY);
        let gen = MEMBER_GEN.fetch_add(1, Ordering::Relaxed);
        let entry = MemberEntry {
            joined_at: now_secs(),
            tx: tx.clone(),
            last_pong: Arc::new(parking_lot::Mutex::new(Instant::now())),
            gen,
        };
        group.members.insert(remote.clone(), entry);

        let welcome = GroupMsg::Welcome {
            group: group_id.to_string(),
            group_name: group.info.name.clone(),
            app_type: group.info.app_type.clone(),
            max_members: group.info.max_members,
            volatile: group.info.volatile,
            members: group.member_list(&self.local_id),
        };
        let _ = tx.try_send(welcome);
        JoinOutcome::Accepted { rx, gen }
    }

    fn member_channel(
        &self,
        group_id: &str,
        peer: &PeerId,
        gen: u64,
    ) -> Option<(mpsc::Sender<GroupMsg>, Arc<parking_lot::Mutex<Instant>>)> {
        let hosted = self.hosted.lock();
        let member = hosted.get(group_id)?.members.get(peer)?;
        (member.gen == gen).then(|| (member.tx.clone(), Arc::clone(&member.last_pong)))
    }

    fn stamp_pong(&self, group_id: &str, peer: &PeerId, gen: u64) {
        if let Some((_, last_pong)) = self.member_channel(group_id, peer, gen) {
            *last_pong.lock() = Instant::now();
        }
    }

    /// Remove a member (generation-checked) and broadcast the new list.
    pub(crate) fn remove_member(&self, group_id: &str, peer: &PeerId, gen: u64) {
        let removed = {
            let mut hosted = self.hosted.lock();
            let Some(group) = hosted.get_mut(group_id) else {
                return;
            };
            match group.members.get(peer) {
                Some(member) if member.gen == gen => {
                    group.members.remove(peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(group = %group_id, peer = %peer, "member removed");
            self.broadcast_members(group_id);
        }
    }

    /// Push the current member list to every member, persist it for
    /// non-volatile groups, and notify local listeners.
    pub(crate) fn broadcast_members(&self, group_id: &str) {
        let (members, txs, volatile, stamps) = {
            let hosted = self.hosted.lock();
            let Some(group) = hosted.get(group_id) else {
                return;
            };
            (
                group.member_list(&self.local_id),
                group
                    .members
                    .values()
                    .map(|m| m.tx.clone())
                    .collect::<Vec<_>>(),
                group.info.volatile,
                group.member_stamps(&self.local_id),
            )
        };

        let update = GroupMsg::Members {
            group: group_id.to_string(),
            members: members.clone(),
        };
        for tx in txs {
            let _ = tx.try_send(update.clone());
        }
        if !volatile {
            if let Err(e) = self.db().lock().save_members(group_id, &stamps) {
                tracing::warn!(group = %group_id, "failed to persist member list: {e}");
            }
        }
        self.emit(GroupEvent::Members {
            group_id: group_id.to_string(),
            members,
        });
    }

    /// Relay a member's payload to every other member and local listeners.
    fn relay(&self, group_id: &str, from: &PeerId, payload: serde_json::Value, state: bool) {
        let txs: Vec<mpsc::Sender<GroupMsg>> = {
            let hosted = self.hosted.lock();
            let Some(group) = hosted.get(group_id) else {
                return;
            };
            group
                .members
                .iter()
                .filter(|(peer, _)| *peer != from)
                .map(|(_, member)| member.tx.clone())
                .collect::<Vec<_>>()
        };
        let msg = if state {
            GroupMsg::State {
                group: group_id.to_string(),
                from: from.0.clone(),
                payload: payload.clone(),
            }
        } else {
            GroupMsg::Msg {
                group: group_id.to_string(),
                from: from.0.clone(),
                payload: payload.clone(),
            }
        };
        for tx in txs {
            // Full queue: that member misses this relay. Never block the host.
            let _ = tx.try_send(msg.clone());
        }
        self.emit(GroupEvent::Message {
            group_id: group_id.to_string(),
            from: from.0.clone(),
            payload,
            state,
        });
    }

    /// Send a payload into a hosted group as the host itself.
    pub(crate) fn host_send(
        &self,
        group_id: &str,
        payload: serde_json::Value,
        state: bool,
    ) -> Result<()> {
        if !self.hosted.lock().contains_key(group_id) {
            return Err(crate::error::Error::NotFound(format!("group {group_id}")));
        }
        let from = self.local_id.clone();
        self.relay(group_id, &from, payload, state);
        Ok(())
    }
}

async fn write_record<W: AsyncWrite + Unpin>(
    send: &mut W,
    msg: &GroupMsg,
    deadline: std::time::Duration,
) -> anyhow::Result<()> {
    let line = msg.to_line()?;
    tokio::time::timeout(deadline, async {
        send.write_all(&line).await?;
        send.flush().await
    })
    .await
    .map_err(|_| anyhow::anyhow!("group write deadline exceeded"))??;
    Ok(())
}
