//! Message-queue transport: reliable typed unicast with ack.
//!
//! Each send opens one stream, writes one envelope, and waits for an ack
//! with a matching id. Incoming messages are ack'd synchronously, then
//! dispatched to three targets in order: prefix-matched topic subscriptions,
//! bounded listener queues, and — only when no listener is registered — a
//! per-sender inbox that is replayed to the first listener that shows up.
//!
//! The sender's identity is never taken from the payload: it is the
//! transport-authenticated remote id of the stream, and an envelope carrying
//! a contradicting `from` field is dropped.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::msgid;
use crate::peers::PeerId;
use crate::ring::Ring;
use crate::substrate::{IncomingConn, Substrate, MQ_ALPN};

/// How long a sender waits for the ack.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Write deadline for the synchronous ack on the receiving side.
pub const ACK_WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Idle window for reading the inbound envelope.
pub const READ_WINDOW: Duration = Duration::from_secs(30);
/// Per-sender inbox capacity; oldest entries drop on overflow.
pub const INBOX_CAPACITY: usize = 200;
/// Upper bound on one wire record.
const MAX_RECORD_BYTES: u64 = 128 * 1024;
/// Capacity of each listener queue.
const LISTENER_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum EnvelopeKind {
    Msg,
    Ack,
}

/// Wire record. `from` is advisory; the authenticated stream remote wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: EnvelopeKind,
    id: String,
    seq: i64,
    topic: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<String>,
}

/// A delivered message, as seen by subscribers and listeners.
#[derive(Debug, Clone)]
pub struct MqMsg {
    pub from: PeerId,
    pub id: String,
    pub seq: i64,
    pub topic: String,
    pub payload: serde_json::Value,
}

/// Async callback invoked once per matching message.
pub type TopicHandler =
    Arc<dyn Fn(MqMsg) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct TopicSub {
    id: u64,
    prefix: String,
    handler: TopicHandler,
}

struct Listener {
    id: u64,
    tx: mpsc::Sender<MqMsg>,
}

/// Identifier returned by [`MqCore::subscribe_topic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubId(u64);

/// Handle for a listener queue; dropping it unsubscribes.
pub struct MqListenerHandle {
    id: u64,
    core: Arc<MqCore>,
}

impl Drop for MqListenerHandle {
    fn drop(&mut self) {
        self.core.listeners.lock().retain(|l| l.id != self.id);
    }
}

/// The network-free dispatch half of the transport.
pub struct MqCore {
    subs: parking_lot::Mutex<Vec<TopicSub>>,
    listeners: parking_lot::Mutex<Vec<Listener>>,
    /// Per-sender buffered messages, stamped with a global arrival counter
    /// so the aggregate replay preserves arrival order.
    inbox: parking_lot::Mutex<HashMap<PeerId, Ring<(u64, MqMsg)>>>,
    arrivals: AtomicU64,
    next_id: AtomicU64,
}

impl Default for MqCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MqCore {
    pub fn new() -> Self {
        Self {
            subs: parking_lot::Mutex::new(Vec::new()),
            listeners: parking_lot::Mutex::new(Vec::new()),
            inbox: parking_lot::Mutex::new(HashMap::new()),
            arrivals: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a handler for every message whose topic starts with `prefix`.
    /// Handlers run asynchronously, once per message.
    pub fn subscribe_topic(
        &self,
        prefix: impl Into<String>,
        handler: TopicHandler,
    ) -> SubId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().push(TopicSub {
            id,
            prefix: prefix.into(),
            handler,
        });
        SubId(id)
    }

    pub fn unsubscribe_topic(&self, sub: SubId) {
        self.subs.lock().retain(|s| s.id != sub.0);
    }

    /// Register a bounded listener queue. Any buffered inbox content is
    /// replayed (in arrival order) to this listener first, then cleared.
    pub fn add_listener(self: &Arc<Self>) -> (MqListenerHandle, mpsc::Receiver<MqMsg>) {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY.max(INBOX_CAPACITY + 1));
        let replay = {
            let mut inbox = self.inbox.lock();
            let mut buffered: Vec<(u64, MqMsg)> = inbox
                .drain()
                .flat_map(|(_, ring)| ring.drain())
                .collect();
            buffered.sort_by_key(|(stamp, _)| *stamp);
            buffered
        };
        for (_, msg) in replay {
            let _ = tx.try_send(msg);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push(Listener { id, tx });
        (
            MqListenerHandle {
                id,
                core: Arc::clone(self),
            },
            rx,
        )
    }

    /// Deliver one message: topic subscriptions always run; listeners get a
    /// non-blocking fan-out; with zero listeners the message lands in the
    /// sender's inbox instead.
    pub fn dispatch(&self, msg: MqMsg) {
        {
            let subs = self.subs.lock();
            for sub in subs.iter() {
                if msg.topic.starts_with(&sub.prefix) {
                    let fut = (sub.handler)(msg.clone());
                    tokio::spawn(fut);
                }
            }
        }

        let mut listeners = self.listeners.lock();
        listeners.retain(|l| !l.tx.is_closed());
        if listeners.is_empty() {
            drop(listeners);
            let stamp = self.arrivals.fetch_add(1, Ordering::Relaxed);
            let mut inbox = self.inbox.lock();
            inbox
                .entry(msg.from.clone())
                .or_insert_with(|| Ring::new(INBOX_CAPACITY))
                .push((stamp, msg));
            return;
        }
        for listener in listeners.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = listener.tx.try_send(msg.clone()) {
                tracing::debug!(listener = listener.id, topic = %msg.topic, "mq event dropped: listener queue full");
            }
        }
    }

    /// Messages currently buffered for `peer`.
    pub fn inbox_len(&self, peer: &PeerId) -> usize {
        self.inbox.lock().get(peer).map_or(0, |r| r.len())
    }
}

/// The full transport: dispatch core plus the wire side.
pub struct Mq {
    substrate: Arc<Substrate>,
    local_id: PeerId,
    seq: AtomicI64,
    core: Arc<MqCore>,
}

impl Mq {
    pub fn new(substrate: Arc<Substrate>) -> Arc<Self> {
        let local_id = substrate.local_id().clone();
        Arc::new(Self {
            substrate,
            local_id,
            seq: AtomicI64::new(0),
            core: Arc::new(MqCore::new()),
        })
    }

    pub fn core(&self) -> &Arc<MqCore> {
        &self.core
    }

    fn next_seq(&self) -> i64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Send one message and wait for its ack.
    pub async fn send(
        &self,
        peer: &PeerId,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<()> {
        // Fail fast when the peer's protocol list is known and MQ is absent.
        if self.substrate.supports(peer, MQ_ALPN) == Some(false) {
            return Err(Error::Unreachable(format!(
                "{peer} does not speak the mq protocol"
            )));
        }

        let envelope = Envelope {
            kind: EnvelopeKind::Msg,
            id: msgid::generate(),
            seq: self.next_seq(),
            topic: topic.into(),
            payload,
            from: Some(self.local_id.0.clone()),
        };

        let pair = self.substrate.dial(peer, MQ_ALPN).await?;
        send_on_stream(pair.recv, pair.send, &envelope, ACK_TIMEOUT).await
    }

    /// Inject a synthetic message into the listener fan-out. No wire
    /// traffic, no ack, no topic subscriptions — this is the node→UI path.
    pub fn local_publish(&self, topic: impl Into<String>, payload: serde_json::Value) {
        let msg = MqMsg {
            from: self.local_id.clone(),
            id: msgid::generate(),
            seq: self.next_seq(),
            topic: topic.into(),
            payload,
        };
        let mut listeners = self.core.listeners.lock();
        listeners.retain(|l| !l.tx.is_closed());
        for listener in listeners.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = listener.tx.try_send(msg.clone()) {
                tracing::debug!(listener = listener.id, topic = %msg.topic, "local publish dropped: listener queue full");
            }
        }
    }

    /// Serve an accepted MQ connection: one envelope per stream, streams
    /// accepted until the connection closes.
    pub async fn handle_conn(self: &Arc<Self>, incoming: IncomingConn) {
        let remote = incoming.remote.clone();
        loop {
            let pair = match crate::substrate::accept_stream(&incoming.conn).await {
                Ok(pair) => pair,
                Err(_) => break, // connection closed
            };
            let core = Arc::clone(&self.core);
            let remote = remote.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_stream(&core, &remote, pair.recv, pair.send).await {
                    tracing::debug!(peer = %remote, "mq stream error: {e}");
                }
            });
        }
    }
}

/// Sender side of one stream: write the envelope, await the matching ack.
async fn send_on_stream<R, W>(
    recv: R,
    mut send: W,
    envelope: &Envelope,
    ack_timeout: Duration,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(envelope).map_err(|e| Error::Invalid(format!("encode: {e}")))?;
    line.push(b'\n');
    send.write_all(&line)
        .await
        .map_err(|e| Error::Unreachable(format!("write: {e}")))?;
    send.flush()
        .await
        .map_err(|e| Error::Unreachable(format!("flush: {e}")))?;

    let mut lines = BufReader::new(recv.take(MAX_RECORD_BYTES)).lines();
    let ack_line = tokio::time::timeout(ack_timeout, lines.next_line())
        .await
        .map_err(|_| Error::Timeout(format!("no ack for {}", envelope.id)))?
        .map_err(|e| Error::Closed(format!("ack read: {e}")))?
        .ok_or_else(|| Error::Closed("stream closed before ack".into()))?;

    let ack: Envelope = serde_json::from_str(&ack_line)
        .map_err(|e| Error::Invalid(format!("ack decode: {e}")))?;
    if ack.kind != EnvelopeKind::Ack || ack.id != envelope.id {
        return Err(Error::Invalid(format!(
            "ack mismatch: got {} for {}",
            ack.id, envelope.id
        )));
    }
    Ok(())
}

/// Receiver side of one stream: read one envelope, ack synchronously, then
/// dispatch regardless of the ack write outcome.
async fn handle_stream<R, W>(
    core: &MqCore,
    remote: &PeerId,
    recv: R,
    mut send: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(recv.take(MAX_RECORD_BYTES)).lines();
    let line = tokio::time::timeout(READ_WINDOW, lines.next_line())
        .await
        .map_err(|_| Error::Timeout("mq read window".into()))?
        .map_err(|e| Error::Closed(format!("read: {e}")))?
        .ok_or_else(|| Error::Closed("empty mq stream".into()))?;

    let envelope: Envelope =
        serde_json::from_str(&line).map_err(|e| Error::Invalid(format!("decode: {e}")))?;
    if envelope.kind != EnvelopeKind::Msg {
        return Err(Error::Invalid("expected a msg record".into()));
    }

    // Synchronous ack; delivery proceeds even if this write fails.
    let ack = Envelope {
        kind: EnvelopeKind::Ack,
        id: envelope.id.clone(),
        seq: envelope.seq,
        topic: envelope.topic.clone(),
        payload: serde_json::Value::Null,
        from: None,
    };
    if let Ok(mut ack_line) = serde_json::to_vec(&ack) {
        ack_line.push(b'\n');
        let write = async {
            send.write_all(&ack_line).await?;
            send.flush().await
        };
        match tokio::time::timeout(ACK_WRITE_DEADLINE, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(peer = %remote, "mq ack write failed: {e}"),
            Err(_) => tracing::debug!(peer = %remote, "mq ack write deadline exceeded"),
        }
    }

    // The payload's own `from` claim must not contradict the stream identity.
    if let Some(claimed) = &envelope.from {
        if claimed != remote.as_str() {
            return Err(Error::Forbidden(format!(
                "sender mismatch: stream {remote}, envelope {claimed}"
            )));
        }
    }

    core.dispatch(MqMsg {
        from: remote.clone(),
        id: envelope.id,
        seq: envelope.seq,
        topic: envelope.topic,
        payload: envelope.payload,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(from: &str, topic: &str, n: i64) -> MqMsg {
        MqMsg {
            from: PeerId::from(from),
            id: msgid::generate(),
            seq: n,
            topic: topic.to_string(),
            payload: json!({ "n": n }),
        }
    }

    #[tokio::test]
    async fn inbox_buffers_then_replays_in_order() {
        let core = Arc::new(MqCore::new());
        for n in 0..3 {
            core.dispatch(msg("peer-p", "chat", n));
        }
        assert_eq!(core.inbox_len(&PeerId::from("peer-p")), 3);

        let (_handle, mut rx) = core.add_listener();
        for n in 0..3 {
            let got = rx.try_recv().unwrap();
            assert_eq!(got.seq, n, "replay preserves arrival order");
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(core.inbox_len(&PeerId::from("peer-p")), 0, "inbox cleared");

        // later messages go to the listener, not the inbox
        core.dispatch(msg("peer-p", "chat", 9));
        assert_eq!(rx.try_recv().unwrap().seq, 9);
        assert_eq!(core.inbox_len(&PeerId::from("peer-p")), 0);
    }

    #[tokio::test]
    async fn inbox_overflow_drops_oldest() {
        let core = Arc::new(MqCore::new());
        for n in 0..(INBOX_CAPACITY as i64 + 5) {
            core.dispatch(msg("peer-p", "chat", n));
        }
        assert_eq!(core.inbox_len(&PeerId::from("peer-p")), INBOX_CAPACITY);
        let (_handle, mut rx) = core.add_listener();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.seq, 5, "oldest five were dropped");
    }

    #[tokio::test]
    async fn topic_subscription_prefix_matching() {
        let core = Arc::new(MqCore::new());
        let (tx, mut rx) = mpsc::channel(16);
        core.subscribe_topic(
            "chat",
            Arc::new(move |m: MqMsg| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(m.topic).await;
                })
            }),
        );

        core.dispatch(msg("p", "chat:room", 1));
        core.dispatch(msg("p", "presence:announce", 2));
        core.dispatch(msg("p", "chat", 3));

        let a = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let b = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a, "chat:room");
        assert_eq!(b, "chat");
        assert!(rx.try_recv().is_err(), "non-matching topic not delivered");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let core = Arc::new(MqCore::new());
        let (tx, mut rx) = mpsc::channel(16);
        let sub = core.subscribe_topic(
            "t",
            Arc::new(move |_m: MqMsg| {
                let tx = tx.clone();
                Box::pin(async move {
                    let _ = tx.send(()).await;
                })
            }),
        );
        core.unsubscribe_topic(sub);
        core.dispatch(msg("p", "t", 1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn receive_stream_acks_and_dispatches() {
        let core = Arc::new(MqCore::new());
        let (_handle, mut listener_rx) = core.add_listener();

        let (ours, theirs) = tokio::io::duplex(4096);
        let (recv, send) = tokio::io::split(ours);
        let remote = PeerId::from("peer-remote");
        let core2 = Arc::clone(&core);
        let server = tokio::spawn(async move { handle_stream(&core2, &remote, recv, send).await });

        let (their_recv, mut their_send) = tokio::io::split(theirs);
        let envelope = json!({
            "type": "msg", "id": "MSG01", "seq": 7, "topic": "chat", "payload": {"text": "hi"}
        });
        their_send
            .write_all(format!("{envelope}\n").as_bytes())
            .await
            .unwrap();

        let mut lines = BufReader::new(their_recv).lines();
        let ack_line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let ack: serde_json::Value = serde_json::from_str(&ack_line).unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "MSG01");
        assert_eq!(ack["seq"], 7);

        server.await.unwrap().unwrap();
        let delivered = listener_rx.try_recv().unwrap();
        assert_eq!(delivered.from, PeerId::from("peer-remote"));
        assert_eq!(delivered.topic, "chat");
    }

    #[tokio::test]
    async fn receive_stream_rejects_sender_mismatch() {
        let core = Arc::new(MqCore::new());
        let (_handle, mut listener_rx) = core.add_listener();

        let (ours, theirs) = tokio::io::duplex(4096);
        let (recv, send) = tokio::io::split(ours);
        let remote = PeerId::from("peer-remote");
        let core2 = Arc::clone(&core);
        let server = tokio::spawn(async move { handle_stream(&core2, &remote, recv, send).await });

        let (_their_recv, mut their_send) = tokio::io::split(theirs);
        let envelope = json!({
            "type": "msg", "id": "MSG02", "seq": 1, "topic": "chat",
            "payload": {}, "from": "someone-else"
        });
        their_send
            .write_all(format!("{envelope}\n").as_bytes())
            .await
            .unwrap();

        let err = server.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)), "{err}");
        assert!(listener_rx.try_recv().is_err(), "mismatched sender not dispatched");
    }

    #[tokio::test]
    async fn send_side_matches_ack() {
        let envelope = Envelope {
            kind: EnvelopeKind::Msg,
            id: "SEND1".to_string(),
            seq: 3,
            topic: "t".to_string(),
            payload: json!(1),
            from: None,
        };

        // correct ack
        let (ours, theirs) = tokio::io::duplex(4096);
        let (recv, send) = tokio::io::split(ours);
        let (their_recv, mut their_send) = tokio::io::split(theirs);
        let responder = tokio::spawn(async move {
            let mut lines = BufReader::new(their_recv).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let got: serde_json::Value = serde_json::from_str(&line).unwrap();
            let ack = json!({"type": "ack", "id": got["id"], "seq": got["seq"], "topic": got["topic"]});
            their_send
                .write_all(format!("{ack}\n").as_bytes())
                .await
                .unwrap();
        });
        send_on_stream(recv, send, &envelope, Duration::from_secs(1))
            .await
            .unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn send_side_rejects_wrong_ack_id() {
        let envelope = Envelope {
            kind: EnvelopeKind::Msg,
            id: "SEND2".to_string(),
            seq: 3,
            topic: "t".to_string(),
            payload: json!(1),
            from: None,
        };
        let (ours, theirs) = tokio::io::duplex(4096);
        let (recv, send) = tokio::io::split(ours);
        let (_their_recv, mut their_send) = tokio::io::split(theirs);
        tokio::spawn(async move {
            let ack = json!({"type": "ack", "id": "OTHER", "seq": 0, "topic": "t"});
            let _ = their_send.write_all(format!("{ack}\n").as_bytes()).await;
        });
        let err = send_on_stream(recv, send, &envelope, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)), "{err}");
    }

    #[tokio::test]
    async fn send_side_times_out_without_ack() {
        let envelope = Envelope {
            kind: EnvelopeKind::Msg,
            id: "SEND3".to_string(),
            seq: 0,
            topic: "t".to_string(),
            payload: serde_json::Value::Null,
            from: None,
        };
        let (ours, theirs) = tokio::io::duplex(4096);
        let (recv, send) = tokio::io::split(ours);
        let _keep_open = theirs; // never acks, never closes
        let err = send_on_stream(recv, send, &envelope, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "{err}");
    }
}
