//! Substrate glue: the QUIC-based p2p transport underneath every protocol.
//!
//! The substrate provides authenticated, ordered, multiplexed streams over
//! named protocol ids (ALPNs). This module owns the endpoint, the dial-side
//! connection cache, the peer capability cache, and the accept loop.
//!
//! Protocol handlers never see QUIC stream types. Each bidirectional stream
//! is bridged to a `DuplexStream` by a pair of pump tasks, so handlers work
//! against plain `AsyncRead + AsyncWrite` halves — and tests can drive them
//! with `tokio::io::duplex` directly, no network required.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use iroh::endpoint::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use crate::error::Error;
use crate::peers::PeerId;

/// Protocol ids, one per family.
pub const CHAT_ALPN: &[u8] = b"/goop/chat/1.0.0";
pub const ENTANGLE_ALPN: &[u8] = b"/goop/entangle/1.0.0";
pub const MQ_ALPN: &[u8] = b"/goop/mq/1.0.0";
pub const GROUP_ALPN: &[u8] = b"/goop/group/1.0.0";
pub const INVITE_ALPN: &[u8] = b"/goop/group-invite/1.0.0";

/// All protocol ids this node serves.
pub const ALL_ALPNS: [&[u8]; 5] = [CHAT_ALPN, ENTANGLE_ALPN, MQ_ALPN, GROUP_ALPN, INVITE_ALPN];

/// Dial deadline for a fresh connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(15);

/// Buffer size of the duplex bridge, matching the pump buffer.
const BRIDGE_BUFFER: usize = 16384;

/// One half-pair of a bridged stream, as seen by a protocol handler.
pub struct StreamPair {
    pub recv: ReadHalf<DuplexStream>,
    pub send: WriteHalf<DuplexStream>,
}

/// An accepted connection, routed by ALPN in the node's accept loop.
pub struct IncomingConn {
    pub remote: PeerId,
    pub alpn: Vec<u8>,
    pub conn: Connection,
}

pub struct Substrate {
    endpoint: iroh::Endpoint,
    local_id: PeerId,
    /// Dial-side connection reuse: (peer, protocol) → live connection.
    conns: parking_lot::Mutex<HashMap<(PeerId, Vec<u8>), Connection>>,
    /// Protocols each peer has announced. Empty/absent = unknown.
    protocols: parking_lot::Mutex<HashMap<PeerId, Vec<String>>>,
}

impl Substrate {
    /// Bind the endpoint and start the accept loop. Accepted connections are
    /// surfaced on the returned channel for the orchestrator to route;
    /// discovered LAN peers on the second channel (empty stream when mDNS is
    /// disabled).
    pub async fn bind(
        secret_key: iroh::SecretKey,
        listen_port: u16,
        enable_mdns: bool,
    ) -> Result<(Arc<Self>, mpsc::Receiver<IncomingConn>, mpsc::Receiver<PeerId>)> {
        let mut builder = iroh::Endpoint::builder()
            .secret_key(secret_key)
            .alpns(ALL_ALPNS.iter().map(|a| a.to_vec()).collect());

        if listen_port != 0 {
            builder = builder.bind_addr(std::net::SocketAddrV4::new(
                std::net::Ipv4Addr::UNSPECIFIED,
                listen_port,
            ))?;
        }
        if enable_mdns {
            builder = builder.discovery_local_network();
        }

        let endpoint = builder.bind().await?;
        let local_id = PeerId(endpoint.id().to_string());
        tracing::info!(id = %local_id, "substrate endpoint bound");

        let substrate = Arc::new(Self {
            endpoint: endpoint.clone(),
            local_id,
            conns: parking_lot::Mutex::new(HashMap::new()),
            protocols: parking_lot::Mutex::new(HashMap::new()),
        });

        let (incoming_tx, incoming_rx) = mpsc::channel(64);
        let ep = endpoint.clone();
        tokio::spawn(async move {
            while let Some(incoming) = ep.accept().await {
                let tx = incoming_tx.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            let routed = IncomingConn {
                                remote: PeerId(conn.remote_id().to_string()),
                                alpn: conn.alpn().to_vec(),
                                conn,
                            };
                            if tx.send(routed).await.is_err() {
                                // Orchestrator is gone; nothing to route to.
                            }
                        }
                        Err(e) => tracing::warn!("incoming connection failed: {e}"),
                    }
                });
            }
            tracing::info!("substrate accept loop ended");
        });

        let (disc_tx, disc_rx) = mpsc::channel(64);
        if enable_mdns {
            let ep = endpoint.clone();
            tokio::spawn(async move {
                use futures::StreamExt;
                let mut stream = std::pin::pin!(ep.discovery_stream());
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(item) => {
                            let peer = PeerId(item.endpoint_id().to_string());
                            if disc_tx.send(peer).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            // Lagged: we missed some discovery events; the
                            // periodic announcer will still reach those peers.
                            tracing::debug!("discovery stream lagged: {e}");
                        }
                    }
                }
                tracing::debug!("discovery stream ended");
            });
        }

        Ok((substrate, incoming_rx, disc_rx))
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Open a stream to `peer` on `alpn`, reusing a cached connection when
    /// one is live. Used by the per-message protocols (chat, MQ, invite).
    pub async fn dial(&self, peer: &PeerId, alpn: &'static [u8]) -> crate::error::Result<StreamPair> {
        let key = (peer.clone(), alpn.to_vec());
        let cached = self.conns.lock().get(&key).cloned();
        if let Some(conn) = cached {
            match conn.open_bi().await {
                Ok((send, recv)) => return Ok(bridge(conn, send, recv)),
                Err(_) => {
                    // Connection died since it was cached; evict and redial.
                    self.conns.lock().remove(&key);
                }
            }
        }

        let conn = self.connect(peer, alpn).await?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| Error::Unreachable(format!("open stream to {peer}: {e}")))?;
        self.conns.lock().insert(key, conn.clone());
        Ok(bridge(conn, send, recv))
    }

    /// Open a dedicated connection plus its single stream. Used by the
    /// long-lived protocols (entangle, group client), where the caller owns
    /// the connection lifetime.
    pub async fn dial_dedicated(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
    ) -> crate::error::Result<(Connection, StreamPair)> {
        let conn = self.connect(peer, alpn).await?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| Error::Unreachable(format!("open stream to {peer}: {e}")))?;
        let pair = bridge(conn.clone(), send, recv);
        Ok((conn, pair))
    }

    async fn connect(&self, peer: &PeerId, alpn: &'static [u8]) -> crate::error::Result<Connection> {
        let endpoint_id: iroh::EndpointId = peer
            .as_str()
            .parse()
            .map_err(|e| Error::Invalid(format!("peer id {peer}: {e}")))?;
        let addr = iroh::EndpointAddr::new(endpoint_id);
        match tokio::time::timeout(DIAL_TIMEOUT, self.endpoint.connect(addr, alpn)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(Error::Unreachable(format!("dial {peer}: {e}"))),
            Err(_) => Err(Error::Timeout(format!("dial {peer}"))),
        }
    }

    // ── Capability cache ───────────────────────────────────────────────

    /// Record the protocol list a peer announced.
    pub fn record_protocols(&self, peer: &PeerId, protocols: Vec<String>) {
        self.protocols.lock().insert(peer.clone(), protocols);
    }

    pub fn forget_protocols(&self, peer: &PeerId) {
        self.protocols.lock().remove(peer);
    }

    /// `Some(false)` only when the peer's protocol list is known and the
    /// protocol is absent; `None` when the list is unknown (dial
    /// optimistically in that case).
    pub fn supports(&self, peer: &PeerId, alpn: &[u8]) -> Option<bool> {
        let protocols = self.protocols.lock();
        let list = protocols.get(peer)?;
        if list.is_empty() {
            return None;
        }
        let wanted = String::from_utf8_lossy(alpn);
        Some(list.iter().any(|p| p == wanted.as_ref()))
    }

    /// Drop the cached connections for a peer (after observed failures).
    pub fn evict(&self, peer: &PeerId) {
        self.conns.lock().retain(|(p, _), _| p != peer);
    }

    /// Close the endpoint. Cached connections get CONNECTION_CLOSE frames
    /// instead of timing out on the remote side.
    pub async fn close(&self) {
        let conns: Vec<Connection> = self.conns.lock().drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close(0u32.into(), b"node shutting down");
        }
        self.endpoint.close().await;
    }
}

/// Bridge a QUIC bidirectional stream to a `DuplexStream`.
///
/// Two pump tasks shuttle bytes; both hold the `Connection` so QUIC
/// keep-alives run for as long as either direction is in use. Dropping the
/// returned pair closes the handler side of the duplex: the send pump drains
/// buffered bytes, finishes the QUIC stream, and both tasks exit.
pub fn bridge(
    conn: Connection,
    send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
) -> StreamPair {
    let (handler_side, bridge_side) = tokio::io::duplex(BRIDGE_BUFFER);
    let (handler_read, handler_write) = tokio::io::split(handler_side);
    let (mut bridge_read, mut bridge_write) = tokio::io::split(bridge_side);

    // QUIC recv → handler reads
    let rx_conn = conn.clone();
    tokio::spawn(async move {
        let mut recv = recv;
        let mut buf = vec![0u8; 4096];
        loop {
            match recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    if bridge_write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break, // stream finished
                Err(_) => break,
            }
        }
        let _ = bridge_write.shutdown().await;
        drop(rx_conn);
    });

    // Handler writes → QUIC send
    tokio::spawn(async move {
        let mut send = send;
        let mut buf = vec![0u8; 4096];
        loop {
            match bridge_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if send.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                    if send.flush().await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        let _ = send.finish();
        drop(conn);
    });

    StreamPair {
        recv: handler_read,
        send: handler_write,
    }
}

/// Accept one bidirectional stream on an incoming connection and bridge it.
pub async fn accept_stream(conn: &Connection) -> crate::error::Result<StreamPair> {
    let (send, recv) = conn
        .accept_bi()
        .await
        .map_err(|e| Error::Closed(format!("accept stream: {e}")))?;
    Ok(bridge(conn.clone(), send, recv))
}
