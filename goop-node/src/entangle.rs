//! Entangle: one long-lived heartbeat stream per peer pair.
//!
//! Each pair of nodes keeps at most one bidirectional stream on the entangle
//! protocol, carrying newline-delimited `{"type":"ping"|"pong"}` records.
//! The stream exists for exactly one reason: the moment it dies, we know the
//! peer is gone, without waiting for a presence TTL to lapse.
//!
//! Duplicate-connection tie-break: when both sides discover each other at
//! the same time, only the side with the lexicographically *lower* PeerID
//! dials; the other serves the incoming stream. Without this rule both
//! sides would treat the other's stream as a duplicate and reset, forever.
//!
//! Slot bookkeeping uses a generation counter (the same trick as a
//! connection registry with replacement): a finished task only clears the
//! slot it was given, never a successor's.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::peers::PeerId;
use crate::substrate::{IncomingConn, StreamPair, Substrate, ENTANGLE_ALPN};

/// Interval between outbound pings on an idle stream.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Per-record write deadline.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Heartbeat wire records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Heartbeat {
    Ping,
    Pong,
}

/// Stream lifecycle events, bridged by the node to the peer table's
/// `set_reachable`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Up(PeerId),
    Down(PeerId),
}

/// True when the local side is the one that dials `remote`.
pub fn initiates(local: &PeerId, remote: &PeerId) -> bool {
    local < remote
}

#[derive(Debug, Clone, Copy)]
pub struct Timing {
    pub ping_interval: Duration,
    pub write_deadline: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            ping_interval: PING_INTERVAL,
            write_deadline: WRITE_DEADLINE,
        }
    }
}

struct Slot {
    gen: u64,
    task: Option<JoinHandle<()>>,
}

/// Per-peer slot table. At most one entry per peer, including pending
/// reservations made before the stream is up.
struct Slots {
    map: parking_lot::Mutex<HashMap<PeerId, Slot>>,
    next_gen: AtomicU64,
}

impl Slots {
    fn new() -> Self {
        Self {
            map: parking_lot::Mutex::new(HashMap::new()),
            next_gen: AtomicU64::new(0),
        }
    }

    /// Reserve the slot for `peer`. `None` when already taken.
    fn reserve(&self, peer: &PeerId) -> Option<u64> {
        let mut map = self.map.lock();
        if map.contains_key(peer) {
            return None;
        }
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        map.insert(peer.clone(), Slot { gen, task: None });
        Some(gen)
    }

    /// Attach the running task to a reservation, unless the reservation was
    /// already cleared (the task races its own registration).
    fn attach(&self, peer: &PeerId, gen: u64, task: JoinHandle<()>) {
        let mut map = self.map.lock();
        match map.get_mut(peer) {
            Some(slot) if slot.gen == gen => slot.task = Some(task),
            _ => task.abort(),
        }
    }

    /// Clear the slot if it still belongs to `gen`. Returns true on removal.
    fn clear(&self, peer: &PeerId, gen: u64) -> bool {
        let mut map = self.map.lock();
        match map.get(peer) {
            Some(slot) if slot.gen == gen => {
                map.remove(peer);
                true
            }
            _ => false,
        }
    }

    fn contains(&self, peer: &PeerId) -> bool {
        self.map.lock().contains_key(peer)
    }

    fn drain(&self) -> Vec<(PeerId, Slot)> {
        self.map.lock().drain().collect()
    }
}

pub struct Entangle {
    substrate: Arc<Substrate>,
    local_id: PeerId,
    slots: Slots,
    events: mpsc::Sender<LinkEvent>,
    timing: Timing,
}

impl Entangle {
    pub fn new(substrate: Arc<Substrate>, events: mpsc::Sender<LinkEvent>) -> Arc<Self> {
        Self::with_timing(substrate, events, Timing::default())
    }

    pub fn with_timing(
        substrate: Arc<Substrate>,
        events: mpsc::Sender<LinkEvent>,
        timing: Timing,
    ) -> Arc<Self> {
        let local_id = substrate.local_id().clone();
        Arc::new(Self {
            substrate,
            local_id,
            slots: Slots::new(),
            events,
            timing,
        })
    }

    /// Ensure a heartbeat stream to `peer` exists or is being established.
    ///
    /// No-op when a slot is already present (even a pending reservation), and
    /// on the higher-id side of the pair, which waits for the incoming
    /// stream instead of dialing.
    pub fn connect(self: &Arc<Self>, peer: &PeerId) {
        if *peer == self.local_id {
            return;
        }
        if !initiates(&self.local_id, peer) {
            return;
        }
        let Some(gen) = self.slots.reserve(peer) else {
            return;
        };

        let this = Arc::clone(self);
        let task_peer = peer.clone();
        let task = tokio::spawn(async move {
            match this.substrate.dial_dedicated(&task_peer, ENTANGLE_ALPN).await {
                Ok((_conn, pair)) => {
                    tracing::debug!(peer = %task_peer, "entangle stream up (dialed)");
                    this.run(task_peer, gen, pair).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %task_peer, "entangle dial failed: {e}");
                    this.slots.clear(&task_peer, gen);
                }
            }
        });
        self.slots.attach(peer, gen, task);
    }

    /// Serve an incoming entangle connection. Duplicate streams for a peer
    /// that already holds a slot are reset immediately.
    pub fn handle_incoming(self: &Arc<Self>, incoming: IncomingConn) {
        let peer = incoming.remote.clone();
        let Some(gen) = self.slots.reserve(&peer) else {
            tracing::debug!(peer = %peer, "resetting duplicate entangle stream");
            incoming.conn.close(0u32.into(), b"duplicate entangle stream");
            return;
        };

        let this = Arc::clone(self);
        let task_peer = peer.clone();
        let task = tokio::spawn(async move {
            match crate::substrate::accept_stream(&incoming.conn).await {
                Ok(pair) => {
                    tracing::debug!(peer = %task_peer, "entangle stream up (accepted)");
                    this.run(task_peer, gen, pair).await;
                }
                Err(e) => {
                    tracing::debug!(peer = %task_peer, "entangle accept failed: {e}");
                    this.slots.clear(&task_peer, gen);
                }
            }
        });
        self.slots.attach(&peer, gen, task);
    }

    /// Drive one established stream until it dies, then clear the slot and
    /// emit `Down`.
    async fn run(&self, peer: PeerId, gen: u64, pair: StreamPair) {
        let _ = self.events.send(LinkEvent::Up(peer.clone())).await;
        if let Err(e) = run_stream(pair.recv, pair.send, self.timing).await {
            tracing::debug!(peer = %peer, "entangle stream error: {e}");
        }
        self.slots.clear(&peer, gen);
        let _ = self.events.send(LinkEvent::Down(peer.clone())).await;
        tracing::debug!(peer = %peer, "entangle stream down");
    }

    pub fn is_entangled(&self, peer: &PeerId) -> bool {
        self.slots.contains(peer)
    }

    /// Abort every stream task. Used on shutdown; no `Down` events are
    /// emitted for aborted streams.
    pub fn shutdown(&self) {
        for (_, slot) in self.slots.drain() {
            if let Some(task) = slot.task {
                task.abort();
            }
        }
    }
}

/// The heartbeat loop over one bridged stream. Returns when the stream ends
/// (EOF), a record fails to decode, or a write misses its deadline.
async fn run_stream<R, W>(recv: R, mut send: W, timing: Timing) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(recv).lines();
    let mut ticker = tokio::time::interval(timing.ping_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // interval fires immediately; the first ping doubles as a liveness probe
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                write_record(&mut send, &Heartbeat::Ping, timing.write_deadline).await?;
            }
            line = lines.next_line() => {
                match line? {
                    None => return Ok(()),
                    Some(line) => match serde_json::from_str::<Heartbeat>(&line)? {
                        Heartbeat::Ping => {
                            write_record(&mut send, &Heartbeat::Pong, timing.write_deadline).await?;
                        }
                        Heartbeat::Pong => {}
                    },
                }
            }
        }
    }
}

async fn write_record<W: AsyncWrite + Unpin>(
    send: &mut W,
    record: &Heartbeat,
    deadline: Duration,
) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    tokio::time::timeout(deadline, async {
        send.write_all(&line).await?;
        send.flush().await
    })
    .await
    .map_err(|_| anyhow::anyhow!("heartbeat write deadline exceeded"))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lower_id_initiates() {
        let a = PeerId::from("aaa");
        let b = PeerId::from("bbb");
        assert!(initiates(&a, &b));
        assert!(!initiates(&b, &a));
        // exactly one side of any distinct pair dials
        assert_ne!(initiates(&a, &b), initiates(&b, &a));
    }

    #[test]
    fn slot_reservation_is_exclusive() {
        let slots = Slots::new();
        let peer = PeerId::from("peer-a");
        let gen = slots.reserve(&peer).unwrap();
        assert!(slots.reserve(&peer).is_none(), "second reserve is refused");
        assert!(slots.contains(&peer));

        // clearing with a stale generation does nothing
        assert!(!slots.clear(&peer, gen + 1));
        assert!(slots.contains(&peer));

        assert!(slots.clear(&peer, gen));
        assert!(!slots.contains(&peer));

        // after clearing, the slot can be taken again
        assert!(slots.reserve(&peer).is_some());
    }

    #[tokio::test]
    async fn stream_answers_ping_with_pong() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (recv, send) = tokio::io::split(ours);
        let timing = Timing {
            ping_interval: Duration::from_secs(600), // keep our own pings out of the way
            write_deadline: Duration::from_secs(1),
        };
        let task = tokio::spawn(run_stream(recv, send, timing));

        let (their_recv, mut their_send) = tokio::io::split(theirs);
        let mut lines = BufReader::new(their_recv).lines();

        // the loop's immediate first tick sends one ping
        let first = lines.next_line().await.unwrap().unwrap();
        assert!(first.contains("ping"), "{first}");

        their_send.write_all(b"{\"type\":\"ping\"}\n").await.unwrap();
        let reply = lines.next_line().await.unwrap().unwrap();
        assert!(reply.contains("pong"), "{reply}");

        // closing the remote side ends the loop cleanly
        drop(their_send);
        drop(lines);
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn stream_dies_on_garbage() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (recv, send) = tokio::io::split(ours);
        let timing = Timing {
            ping_interval: Duration::from_secs(600),
            write_deadline: Duration::from_secs(1),
        };
        let task = tokio::spawn(run_stream(recv, send, timing));

        let (their_recv, mut their_send) = tokio::io::split(theirs);
        let mut lines = BufReader::new(their_recv).lines();
        let _first_ping = lines.next_line().await.unwrap();

        their_send.write_all(b"not json\n").await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_err(), "decode failure must kill the stream");
    }

    #[tokio::test]
    async fn pings_flow_on_interval() {
        let (ours, theirs) = tokio::io::duplex(1024);
        let (recv, send) = tokio::io::split(ours);
        let timing = Timing {
            ping_interval: Duration::from_millis(20),
            write_deadline: Duration::from_secs(1),
        };
        let _task = tokio::spawn(run_stream(recv, send, timing));

        let (their_recv, _their_send) = tokio::io::split(theirs);
        let mut lines = BufReader::new(their_recv).lines();
        for _ in 0..3 {
            let line = tokio::time::timeout(Duration::from_secs(1), lines.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(line.contains("ping"));
        }
    }
}
