//! Presence: announcements, LAN discovery bridging, rendezvous client.
//!
//! Discovery only surfaces peer *ids*; everything else a node knows about a
//! peer arrives in announce messages on the MQ topic `presence:announce`.
//! Each announce carries the sender's profile, its supported protocol list
//! (feeding the capability cache the MQ sender consults), and its mDNS
//! cohort tag — announces from a different cohort are ignored.
//!
//! The rendezvous server itself is an external collaborator; this module
//! implements only the joining side: register ourselves, fetch the peer
//! list, and seed the table with what comes back.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{P2pConfig, PresenceConfig};
use crate::mq::{Mq, MqMsg};
use crate::peers::{PeerId, PeerProfile, PeerTable};
use crate::substrate::{Substrate, ALL_ALPNS};

/// Topic for profile announcements.
pub const ANNOUNCE_TOPIC: &str = "presence:announce";
/// Topic for best-effort shutdown notices.
pub const GONE_TOPIC: &str = "presence:gone";
/// Per-peer send budget for one announce round.
const ANNOUNCE_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload of an announce message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announce {
    pub tag: String,
    /// Presence topic the sender gossips on.
    pub topic: String,
    #[serde(flatten)]
    pub profile: PeerProfile,
    pub protocols: Vec<String>,
}

/// Parse and cohort-filter an announce payload. Both the mDNS tag and the
/// presence topic must match ours; either mismatch means a different
/// deployment sharing the same LAN.
pub(crate) fn parse_announce(
    our_tag: &str,
    our_topic: &str,
    payload: &serde_json::Value,
) -> Option<Announce> {
    let announce: Announce = serde_json::from_value(payload.clone()).ok()?;
    if announce.tag != our_tag || announce.topic != our_topic {
        return None;
    }
    Some(announce)
}

pub struct Presence {
    substrate: Arc<Substrate>,
    mq: Arc<Mq>,
    peers: PeerTable,
    presence_cfg: PresenceConfig,
    p2p_cfg: P2pConfig,
    profile: parking_lot::Mutex<PeerProfile>,
}

impl Presence {
    pub fn new(
        substrate: Arc<Substrate>,
        mq: Arc<Mq>,
        peers: PeerTable,
        presence_cfg: PresenceConfig,
        p2p_cfg: P2pConfig,
        profile: PeerProfile,
    ) -> Arc<Self> {
        Arc::new(Self {
            substrate,
            mq,
            peers,
            presence_cfg,
            p2p_cfg,
            profile: parking_lot::Mutex::new(profile),
        })
    }

    /// Spawn the discovery bridge, the heartbeat announcer, and (when
    /// configured) the rendezvous poller.
    pub fn start(self: &Arc<Self>, mut discovery: mpsc::Receiver<PeerId>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(peer) = discovery.recv().await {
                if peer == *this.substrate.local_id() {
                    continue;
                }
                tracing::debug!(peer = %peer, "discovered on the local network");
                this.peers.seed(&peer, PeerProfile::default());
                this.announce_to(&peer).await;
            }
        });

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(this.presence_cfg.heartbeat_seconds));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                this.announce_all().await;
            }
        });

        if let Some(host) = self.presence_cfg.rendezvous_host.clone() {
            let this = Arc::clone(self);
            let base = format!("http://{host}:{}", self.presence_cfg.rendezvous_port);
            tokio::spawn(async move {
                let client = match reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                {
                    Ok(client) => client,
                    Err(e) => {
                        tracing::error!("rendezvous client unavailable: {e}");
                        return;
                    }
                };
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(this.presence_cfg.heartbeat_seconds));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    match this.rendezvous_cycle(&client, &base).await {
                        Ok(n) if n > 0 => {
                            tracing::debug!(new_peers = n, "rendezvous round complete")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("rendezvous round failed: {e}"),
                    }
                }
            });
        }
    }

    /// Route an inbound `presence:*` message.
    pub fn handle_message(self: &Arc<Self>, msg: MqMsg) {
        match msg.topic.as_str() {
            ANNOUNCE_TOPIC => {
                let Some(announce) = parse_announce(
                    &self.p2p_cfg.mdns_tag,
                    &self.presence_cfg.topic,
                    &msg.payload,
                ) else {
                    tracing::debug!(peer = %msg.from, "ignoring announce from another cohort");
                    return;
                };
                self.substrate
                    .record_protocols(&msg.from, announce.protocols);
                self.peers.upsert(&msg.from, announce.profile);
            }
            GONE_TOPIC => {
                tracing::debug!(peer = %msg.from, "peer announced shutdown");
                self.peers.mark_offline(&msg.from);
                self.substrate.evict(&msg.from);
            }
            other => tracing::debug!(topic = other, "unhandled presence topic"),
        }
    }

    /// Replace the advertised profile and push it out immediately.
    pub async fn set_profile(self: &Arc<Self>, profile: PeerProfile) {
        *self.profile.lock() = profile;
        self.announce_all().await;
    }

    fn announce_payload(&self) -> serde_json::Value {
        let announce = Announce {
            tag: self.p2p_cfg.mdns_tag.clone(),
            topic: self.presence_cfg.topic.clone(),
            profile: self.profile.lock().clone(),
            protocols: ALL_ALPNS
                .iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        };
        serde_json::to_value(announce).unwrap_or_default()
    }

    async fn announce_to(&self, peer: &PeerId) {
        let payload = self.announce_payload();
        let send = self.mq.send(peer, ANNOUNCE_TOPIC, payload);
        match tokio::time::timeout(ANNOUNCE_SEND_TIMEOUT, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(peer = %peer, "announce failed: {e}"),
            Err(_) => tracing::debug!(peer = %peer, "announce timed out"),
        }
    }

    async fn announce_all(&self) {
        for peer in self.peers.snapshot() {
            self.announce_to(&peer.id).await;
        }
    }

    /// Tell every online peer we are going away. Best-effort, used by the
    /// orchestrator during shutdown.
    pub async fn broadcast_gone(&self) {
        for peer in self.peers.online_ids() {
            let send = self.mq.send(&peer, GONE_TOPIC, serde_json::Value::Null);
            match tokio::time::timeout(ANNOUNCE_SEND_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!(peer = %peer, "gone notice failed: {e}"),
                Err(_) => tracing::debug!(peer = %peer, "gone notice timed out"),
            }
        }
    }

    /// One rendezvous round: register, fetch, seed. Returns how many
    /// previously unknown peers were seeded.
    async fn rendezvous_cycle(&self, client: &reqwest::Client, base: &str) -> anyhow::Result<usize> {
        #[derive(Serialize)]
        struct Register<'a> {
            peer: &'a str,
            wan: bool,
        }
        #[derive(Deserialize)]
        struct PeerList {
            peers: Vec<String>,
        }

        client
            .post(format!("{base}/announce"))
            .json(&Register {
                peer: self.substrate.local_id().as_str(),
                wan: self.presence_cfg.rendezvous_wan,
            })
            .send()
            .await?
            .error_for_status()?;

        let list: PeerList = client
            .get(format!("{base}/peers"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut seeded = 0;
        for raw in list.peers {
            let peer = PeerId(raw);
            if peer == *self.substrate.local_id() || self.peers.get(&peer).is_some() {
                continue;
            }
            self.peers.seed(&peer, PeerProfile::default());
            self.announce_to(&peer).await;
            seeded += 1;
        }
        Ok(seeded)
    }
}
