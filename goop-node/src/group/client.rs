//! Client side: join remote groups, keep the stream alive, reconnect.
//!
//! One long-lived stream per joined group. All writes go through a bounded
//! queue drained by a single writer task, which is what serialises pongs
//! against application sends. The read loop enforces a refreshing idle
//! deadline: any inbound record (the host pings at least every 30 s) resets
//! it, and silence past the pong deadline means the host is gone.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::wire::{GroupMsg, ERR_FULL, ERR_NOT_FOUND};
use super::{GroupEvent, GroupManager, Subscription, MEMBER_QUEUE_CAPACITY};
use crate::error::{Error, Result};
use crate::peers::PeerId;
use crate::substrate::GROUP_ALPN;

static CLIENT_GEN: AtomicU64 = AtomicU64::new(0);

pub(crate) struct ActiveGroup {
    pub sub: Subscription,
    pub tx: mpsc::Sender<GroupMsg>,
    pub task: JoinHandle<()>,
    pub gen: u64,
}

impl GroupManager {
    /// Join a group hosted on `host`. Any existing connection to the same
    /// group id is left first. On success the subscription is persisted so
    /// the node can reconnect after a restart.
    pub async fn join_remote_group(
        self: &Arc<Self>,
        host: &PeerId,
        group_id: &str,
    ) -> Result<Subscription> {
        self.leave_active(group_id).await;

        let (_conn, pair) = self
            .substrate()?
            .dial_dedicated(host, GROUP_ALPN)
            .await?;
        self.join_with_pair(host, group_id, pair.recv, pair.send)
            .await
    }

    /// The transport-free join flow, driven by tests over a duplex pair.
    pub(crate) async fn join_with_pair<R, W>(
        self: &Arc<Self>,
        host: &PeerId,
        group_id: &str,
        recv: R,
        send: W,
    ) -> Result<Subscription>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let timing = self.timing;
        let mut send = send;
        let mut lines = BufReader::new(recv).lines();

        let join = GroupMsg::Join {
            group: group_id.to_string(),
        };
        write_record(&mut send, &join, timing.write_deadline).await?;

        let reply = tokio::time::timeout(timing.welcome_timeout, lines.next_line())
            .await
            .map_err(|_| Error::Timeout(format!("no welcome from {host}")))?
            .map_err(|e| Error::Closed(format!("welcome read: {e}")))?
            .ok_or_else(|| Error::Closed("stream closed before welcome".into()))?;

        let (sub, members) = match serde_json::from_str::<GroupMsg>(&reply) {
            Ok(GroupMsg::Welcome {
                group,
                group_name,
                app_type,
                volatile,
                members,
                ..
            }) if group == group_id => (
                Subscription {
                    host: host.clone(),
                    group_id: group.clone(),
                    name: group_name,
                    app_type,
                    volatile,
                    role: "member".to_string(),
                },
                members,
            ),
            Ok(GroupMsg::Error { code, message }) => {
                return Err(match code.as_str() {
                    ERR_FULL => Error::Full(message),
                    ERR_NOT_FOUND => Error::NotFound(message),
                    _ => Error::Invalid(message),
                });
            }
            Ok(other) => {
                return Err(Error::Invalid(format!("expected welcome, got {other:?}")));
            }
            Err(e) => return Err(Error::Invalid(format!("welcome decode: {e}"))),
        };

        if let Err(e) = self.db().lock().save_subscription(&sub) {
            tracing::warn!(group = %group_id, "failed to persist subscription: {e}");
        }

        let (tx, mut rx) = mpsc::channel::<GroupMsg>(MEMBER_QUEUE_CAPACITY);
        let gen = CLIENT_GEN.fetch_add(1, Ordering::Relaxed);

        // Writer task: the single place this stream is written.
        let writer_group = group_id.to_string();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if write_record(&mut send, &msg, timing.write_deadline)
                    .await
                    .is_err()
                {
                    tracing::debug!(group = %writer_group, "client write failed");
                    break;
                }
            }
        });

        // Read loop with refreshing idle deadline.
        let read_mgr = Arc::clone(self);
        let read_sub = sub.clone();
        let read_tx = tx.clone();
        let task = tokio::spawn(async move {
            read_mgr.run_client_stream(read_sub, gen, lines, read_tx).await;
        });

        self.active.lock().await.insert(
            group_id.to_string(),
            ActiveGroup {
                sub: sub.clone(),
                tx,
                task,
                gen,
            },
        );
        tracing::info!(group = %group_id, host = %host, "joined remote group");
        self.emit(GroupEvent::Joined {
            group_id: group_id.to_string(),
        });
        self.emit(GroupEvent::Members {
            group_id: group_id.to_string(),
            members,
        });
        Ok(sub)
    }

    async fn run_client_stream<R>(
        self: Arc<Self>,
        sub: Subscription,
        gen: u64,
        mut lines: tokio::io::Lines<BufReader<R>>,
        tx: mpsc::Sender<GroupMsg>,
    ) where
        R: AsyncRead + Unpin,
    {
        let timing = self.timing;
        let group_id = sub.group_id.clone();
        let mut closed_by_host = false;

        loop {
            let line = match tokio::time::timeout(timing.pong_deadline, lines.next_line()).await {
                Err(_) => {
                    tracing::info!(group = %group_id, "group stream idle deadline exceeded");
                    break;
                }
                Ok(Ok(Some(line))) => line,
                Ok(_) => break, // EOF or read error
            };
            let msg = match serde_json::from_str::<GroupMsg>(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::debug!(group = %group_id, "bad group record: {e}");
                    break;
                }
            };
            match msg {
                GroupMsg::Ping {} => {
                    let _ = tx.try_send(GroupMsg::Pong {});
                }
                GroupMsg::Close { .. } => {
                    tracing::info!(group = %group_id, "group closed by host");
                    if let Err(e) = self.db().lock().delete_subscription(&group_id) {
                        tracing::warn!(group = %group_id, "failed to drop subscription: {e}");
                    }
                    closed_by_host = true;
                    break;
                }
                GroupMsg::Members { members, .. } => {
                    if !sub.volatile {
                        let stamps = members
                            .iter()
                            .map(|m| (PeerId(m.clone()), super::now_secs()))
                            .collect();
                        if let Err(e) = self.db().lock().save_members(&group_id, &stamps) {
                            tracing::warn!(group = %group_id, "failed to persist members: {e}");
                        }
                    }
                    self.emit(GroupEvent::Members {
                        group_id: group_id.clone(),
                        members,
                    });
                }
                GroupMsg::Meta {
                    group_name,
                    app_type,
                    max_members,
                    ..
                } => {
                    let updated = Subscription {
                        name: group_name.clone(),
                        app_type: app_type.clone(),
                        ..sub.clone()
                    };
                    if let Err(e) = self.db().lock().save_subscription(&updated) {
                        tracing::warn!(group = %group_id, "failed to persist subscription: {e}");
                    }
                    self.emit(GroupEvent::Meta {
                        group_id: group_id.clone(),
                        name: group_name,
                        app_type,
                        max_members,
                    });
                }
                GroupMsg::Msg { from, payload, .. } => {
                    self.emit(GroupEvent::Message {
                        group_id: group_id.clone(),
                        from,
                        payload,
                        state: false,
                    });
                }
                GroupMsg::State { from, payload, .. } => {
                    self.emit(GroupEvent::Message {
                        group_id: group_id.clone(),
                        from,
                        payload,
                        state: true,
                    });
                }
                other => {
                    tracing::debug!(group = %group_id, "ignoring {other:?}");
                }
            }
        }

        // Local cleanup always runs; only our own generation is removed.
        {
            let mut active = self.active.lock().await;
            if active.get(&group_id).is_some_and(|a| a.gen == gen) {
                active.remove(&group_id);
            }
        }
        if closed_by_host {
            tracing::debug!(group = %group_id, "subscription dropped after close");
        }
        self.emit(GroupEvent::Closed {
            group_id: group_id.clone(),
        });
    }

    /// Send a payload into a subscribed group.
    pub(crate) async fn client_send(
        &self,
        group_id: &str,
        payload: serde_json::Value,
        state: bool,
    ) -> Result<()> {
        let active = self.active.lock().await;
        let conn = active
            .get(group_id)
            .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
        let msg = if state {
            GroupMsg::State {
                group: group_id.to_string(),
                from: self.local_id().0.clone(),
                payload,
            }
        } else {
            GroupMsg::Msg {
                group: group_id.to_string(),
                from: self.local_id().0.clone(),
                payload,
            }
        };
        conn.tx
            .try_send(msg)
            .map_err(|_| Error::Full(format!("send queue for group {group_id}")))
    }

    /// Drop the live connection to a group, sending `leave` when possible.
    /// The subscription stays persisted.
    pub(crate) async fn leave_active(&self, group_id: &str) {
        let Some(conn) = self.active.lock().await.remove(group_id) else {
            return;
        };
        let _ = conn.tx.try_send(GroupMsg::Leave {
            group: group_id.to_string(),
        });
        // Give the writer a moment to flush the leave, then stop reading.
        let task = conn.task;
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            task.abort();
        });
    }

    /// Leave a group and forget its subscription.
    pub async fn unsubscribe(self: &Arc<Self>, group_id: &str) -> Result<()> {
        self.leave_active(group_id).await;
        self.db().lock().delete_subscription(group_id)?;
        self.emit(GroupEvent::Closed {
            group_id: group_id.to_string(),
        });
        Ok(())
    }

    /// Reconnect every persisted subscription after the discovery grace
    /// period. Failures are logged, not fatal; a failed volatile
    /// subscription is dropped (its session is gone for good).
    pub async fn reconnect_subscriptions(self: &Arc<Self>, grace: std::time::Duration) {
        tokio::time::sleep(grace).await;
        let subs = self.db().lock().load_subscriptions().unwrap_or_default();
        for sub in subs {
            if self.active.lock().await.contains_key(&sub.group_id) {
                continue;
            }
            match self.join_remote_group(&sub.host, &sub.group_id).await {
                Ok(_) => tracing::info!(group = %sub.group_id, host = %sub.host, "reconnected"),
                Err(e) => {
                    tracing::warn!(group = %sub.group_id, host = %sub.host, "reconnect failed: {e}");
                    if sub.volatile {
                        let _ = self.db().lock().delete_subscription(&sub.group_id);
                    }
                }
            }
        }
    }
}

async fn write_record<W: AsyncWrite + Unpin>(
    send: &mut W,
    msg: &GroupMsg,
    deadline: std::time::Duration,
) -> Result<()> {
    let line = msg
        .to_line()
        .map_err(|e| Error::Invalid(format!("encode: {e}")))?;
    tokio::time::timeout(deadline, async {
        send.write_all(&line).await?;
        send.flush().await
    })
    .await
    .map_err(|_| Error::Timeout("group write deadline".into()))?
    .map_err(|e| Error::Closed(format!("write: {e}")))?;
    Ok(())
}
