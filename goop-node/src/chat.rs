//! Chat: one JSON message object per stream.
//!
//! Chat is fire-and-forget (no ack — delivery confidence comes from the
//! substrate's ordered streams). Inbound messages are validated against the
//! stream's authenticated remote, kept in a bounded history ring, and handed
//! to the orchestrator, which routes `!commands` into the script engine and
//! publishes the rest to UI listeners.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::msgid;
use crate::peers::PeerId;
use crate::ring::Ring;
use crate::substrate::{IncomingConn, Substrate, CHAT_ALPN};

/// Leading character that marks a chat message as a script command.
pub const COMMAND_SENTINEL: char = '!';

/// Retained message history (ephemeral, gone when the node stops).
const HISTORY_CAPACITY: usize = 500;
/// Upper bound on one chat object.
const MAX_CHAT_BYTES: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Direct,
    Broadcast,
    Site,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: ChatKind,
    pub content: String,
    pub timestamp_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_id: Option<String>,
}

impl ChatMessage {
    /// Split `!name args` into the command name and its argument string.
    /// `None` when the content is not a command.
    pub fn command(&self) -> Option<(&str, &str)> {
        let rest = self.content.strip_prefix(COMMAND_SENTINEL)?;
        if rest.is_empty() {
            return None;
        }
        match rest.split_once(char::is_whitespace) {
            Some((name, args)) => Some((name, args.trim_start())),
            None => Some((rest, "")),
        }
    }
}

pub struct Chat {
    substrate: Arc<Substrate>,
    local_id: PeerId,
    history: Ring<ChatMessage>,
    inbound: mpsc::Sender<ChatMessage>,
}

impl Chat {
    pub fn new(substrate: Arc<Substrate>, inbound: mpsc::Sender<ChatMessage>) -> Arc<Self> {
        let local_id = substrate.local_id().clone();
        Arc::new(Self {
            substrate,
            local_id,
            history: Ring::new(HISTORY_CAPACITY),
            inbound,
        })
    }

    /// Send one message to `peer`. Returns the message as sent (with id and
    /// timestamp filled in) so callers can append it to their own views.
    pub async fn send(
        &self,
        peer: &PeerId,
        kind: ChatKind,
        content: impl Into<String>,
        site_id: Option<String>,
    ) -> Result<ChatMessage> {
        let msg = ChatMessage {
            id: msgid::generate(),
            from: self.local_id.0.clone(),
            to: peer.0.clone(),
            kind,
            content: content.into(),
            timestamp_ms: now_ms(),
            site_id,
        };
        let bytes = serde_json::to_vec(&msg).map_err(|e| Error::Invalid(format!("encode: {e}")))?;

        let pair = self.substrate.dial(peer, CHAT_ALPN).await?;
        let mut send = pair.send;
        send.write_all(&bytes)
            .await
            .map_err(|e| Error::Unreachable(format!("write: {e}")))?;
        send.shutdown()
            .await
            .map_err(|e| Error::Unreachable(format!("close: {e}")))?;

        self.history.push(msg.clone());
        Ok(msg)
    }

    /// Best-effort fan-out to many peers. Returns how many sends succeeded.
    pub async fn broadcast(&self, peers: &[PeerId], content: &str) -> usize {
        let mut delivered = 0;
        for peer in peers {
            match self
                .send(peer, ChatKind::Broadcast, content, None)
                .await
            {
                Ok(_) => delivered += 1,
                Err(e) => tracing::debug!(peer = %peer, "chat broadcast skipped: {e}"),
            }
        }
        delivered
    }

    /// Serve an accepted chat connection: one message object per stream.
    pub async fn handle_conn(self: &Arc<Self>, incoming: IncomingConn) {
        let remote = incoming.remote.clone();
        loop {
            let pair = match crate::substrate::accept_stream(&incoming.conn).await {
                Ok(pair) => pair,
                Err(_) => break,
            };
            let this = Arc::clone(self);
            let remote = remote.clone();
            tokio::spawn(async move {
                match read_message(&remote, pair.recv).await {
                    Ok(msg) => this.deliver(msg).await,
                    Err(e) => tracing::debug!(peer = %remote, "chat stream error: {e}"),
                }
            });
        }
    }

    async fn deliver(&self, msg: ChatMessage) {
        self.history.push(msg.clone());
        if self.inbound.send(msg).await.is_err() {
            tracing::debug!("chat delivery channel closed");
        }
    }

    /// Copy of the retained history, oldest first.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.snapshot()
    }
}

/// Read and validate one inbound chat object.
async fn read_message<R>(remote: &PeerId, recv: R) -> Result<ChatMessage>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut raw = String::new();
    let mut limited = recv.take(MAX_CHAT_BYTES);
    limited
        .read_to_string(&mut raw)
        .await
        .map_err(|e| Error::Closed(format!("read: {e}")))?;

    let msg: ChatMessage =
        serde_json::from_str(&raw).map_err(|e| Error::Invalid(format!("decode: {e}")))?;
    if msg.from != remote.as_str() {
        return Err(Error::Forbidden(format!(
            "sender mismatch: stream {remote}, message {}",
            msg.from
        )));
    }
    Ok(msg)
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
