//! Group invitations, on their own protocol id.
//!
//! An invite is a single JSON object per stream, fire-and-forget. The
//! receiving side persists the subscription *before* any join attempt, so
//! the user still sees the invitation when the join fails transiently.
//! Invites for the `realtime` app type join immediately; everything else
//! waits for explicit user action.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{GroupEvent, GroupManager, Subscription, REALTIME_APP_TYPE};
use crate::error::{Error, Result};
use crate::peers::PeerId;
use crate::substrate::{IncomingConn, INVITE_ALPN};

/// Upper bound on one invite object.
const MAX_INVITE_BYTES: u64 = 16 * 1024;

/// Invite wire record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invite {
    pub group: String,
    pub name: String,
    pub app_type: String,
    pub volatile: bool,
}

impl GroupManager {
    /// Invite `peer` into a group this node hosts.
    pub async fn send_invite(self: &Arc<Self>, peer: &PeerId, group_id: &str) -> Result<()> {
        let invite = {
            let hosted = self.hosted.lock();
            let group = hosted
                .get(group_id)
                .ok_or_else(|| Error::NotFound(format!("group {group_id}")))?;
            Invite {
                group: group.info.id.clone(),
                name: group.info.name.clone(),
                app_type: group.info.app_type.clone(),
                volatile: group.info.volatile,
            }
        };
        let bytes =
            serde_json::to_vec(&invite).map_err(|e| Error::Invalid(format!("encode: {e}")))?;

        let pair = self.substrate()?.dial(peer, INVITE_ALPN).await?;
        let mut send = pair.send;
        send.write_all(&bytes)
            .await
            .map_err(|e| Error::Unreachable(format!("write: {e}")))?;
        send.shutdown()
            .await
            .map_err(|e| Error::Unreachable(format!("close: {e}")))?;
        tracing::info!(group = %group_id, peer = %peer, "invite sent");
        Ok(())
    }

    /// Serve an accepted invite connection.
    pub async fn handle_invite_conn(self: &Arc<Self>, incoming: IncomingConn) {
        let remote = incoming.remote.clone();
        let pair = match crate::substrate::accept_stream(&incoming.conn).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::debug!(peer = %remote, "invite accept failed: {e}");
                return;
            }
        };
        let mut raw = String::new();
        let mut limited = pair.recv.take(MAX_INVITE_BYTES);
        if let Err(e) = limited.read_to_string(&mut raw).await {
            tracing::debug!(peer = %remote, "invite read failed: {e}");
            return;
        }
        match serde_json::from_str::<Invite>(&raw) {
            Ok(invite) => self.process_invite(remote, invite).await,
            Err(e) => tracing::debug!(peer = %remote, "bad invite: {e}"),
        }
    }

    /// Apply a received invite: evict same-type groups for volatile invites,
    /// persist the subscription first, then auto-join realtime sessions.
    pub(crate) async fn process_invite(self: &Arc<Self>, host: PeerId, invite: Invite) {
        tracing::info!(group = %invite.group, host = %host, app_type = %invite.app_type, "invite received");
        if invite.volatile {
            self.evict_app_type(&invite.app_type).await;
        }

        let sub = Subscription {
            host: host.clone(),
            group_id: invite.group.clone(),
            name: invite.name.clone(),
            app_type: invite.app_type.clone(),
            volatile: invite.volatile,
            role: "member".to_string(),
        };
        if let Err(e) = self.db().lock().save_subscription(&sub) {
            tracing::warn!(group = %invite.group, "failed to persist invite subscription: {e}");
        }
        self.emit(GroupEvent::Invited {
            subscription: sub.clone(),
        });

        if invite.app_type == REALTIME_APP_TYPE {
            let mgr = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = mgr.join_remote_group(&sub.host, &sub.group_id).await {
                    tracing::warn!(group = %sub.group_id, "realtime auto-join failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::test_manager;

    #[tokio::test]
    async fn invite_persists_subscription_before_join() {
        let mgr = test_manager();
        let (_handle, mut rx) = mgr.subscribe();
        let invite = Invite {
            group: "g-remote".to_string(),
            name: "remote group".to_string(),
            app_type: "chat".to_string(),
            volatile: false,
        };
        mgr.process_invite(PeerId::from("peer-host-b"), invite).await;

        let subs = mgr.db().lock().load_subscriptions().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].group_id, "g-remote");
        assert_eq!(subs[0].host, PeerId::from("peer-host-b"));

        match rx.try_recv().unwrap() {
            GroupEvent::Invited { subscription } => {
                assert_eq!(subscription.group_id, "g-remote")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn volatile_invite_evicts_same_app_type() {
        let mgr = test_manager();
        let session = mgr
            .create_group("old session", "game", 0, true)
            .await
            .unwrap();

        let invite = Invite {
            group: "g-remote".to_string(),
            name: "their session".to_string(),
            app_type: "game".to_string(),
            volatile: true,
        };
        mgr.process_invite(PeerId::from("peer-host-b"), invite).await;

        assert!(
            !mgr.hosted.lock().contains_key(&session.id),
            "hosted same-type group evicted by volatile invite"
        );
    }

    #[test]
    fn invite_wire_shape() {
        let invite = Invite {
            group: "g".to_string(),
            name: "n".to_string(),
            app_type: "realtime".to_string(),
            volatile: true,
        };
        let value = serde_json::to_value(&invite).unwrap();
        assert_eq!(value["group"], "g");
        assert_eq!(value["volatile"], true);
    }
}
