//! Node orchestrator: owns the identity and wires every subsystem.
//!
//! Startup order is leaves-first: identity → substrate → storage → peer
//! table → entangle/MQ/chat → presence → groups → script engine, then the
//! bridges between them: substrate links feed the peer table's `reachable`
//! flag, peer-table events feed the MQ local topics `peer:announce` /
//! `peer:gone` (and kick the entangle dialer), chat `!commands` and MQ
//! `call:` messages feed the script engine.
//!
//! Shutdown is orderly: announce departure, stop bridge tasks, close group
//! streams, close entangle streams, close the endpoint.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Result;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::chat::{Chat, ChatKind, ChatMessage};
use crate::config::Config;
use crate::db::Db;
use crate::entangle::{Entangle, LinkEvent};
use crate::error::Error;
use crate::group::{GroupEvent, GroupInfo, GroupListenerHandle, GroupManager, Subscription, RECONNECT_GRACE};
use crate::identity;
use crate::mq::{Mq, MqListenerHandle, MqMsg};
use crate::peers::{PeerEvent, PeerId, PeerProfile, PeerTable, SeenPeer};
use crate::presence::Presence;
use crate::script::{Engine, Identity};
use crate::substrate::{self, IncomingConn, Substrate};

/// Database file name inside the peer directory.
const DB_FILE: &str = "data.db";

pub struct Node {
    config: Config,
    peer_dir: PathBuf,
    substrate: Arc<Substrate>,
    peers: PeerTable,
    entangle: Arc<Entangle>,
    mq: Arc<Mq>,
    chat: Arc<Chat>,
    presence: Arc<Presence>,
    groups: Arc<GroupManager>,
    engine: Arc<Engine>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Load the configuration from `peer_dir` and start the node.
    pub async fn start(peer_dir: PathBuf) -> Result<Arc<Self>> {
        let config = Config::load(&peer_dir)?;
        Self::start_with_config(peer_dir, config).await
    }

    pub async fn start_with_config(peer_dir: PathBuf, config: Config) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&peer_dir)?;
        let key = identity::load_or_create_secret_key(&peer_dir.join(&config.identity.key_file))?;

        let enable_mdns = !config.presence.rendezvous_only;
        let (substrate, incoming_rx, discovery_rx) =
            Substrate::bind(key, config.p2p.listen_port, enable_mdns).await?;
        let local_id = substrate.local_id().clone();
        tracing::info!(id = %local_id, "node starting");

        let db = Arc::new(parking_lot::Mutex::new(Db::open(peer_dir.join(DB_FILE))?));
        let peers = PeerTable::new();

        let (link_tx, link_rx) = mpsc::channel(64);
        let entangle = Entangle::new(Arc::clone(&substrate), link_tx);

        let mq = Mq::new(Arc::clone(&substrate));

        let (chat_tx, chat_rx) = mpsc::channel(256);
        let chat = Chat::new(Arc::clone(&substrate), chat_tx);

        let presence = Presence::new(
            Arc::clone(&substrate),
            Arc::clone(&mq),
            peers.clone(),
            config.presence.clone(),
            config.p2p.clone(),
            PeerProfile::default(),
        );

        let groups = GroupManager::new(local_id.clone(), Arc::clone(&db));
        groups.bind_substrate(Arc::clone(&substrate));
        groups.restore_hosted();

        let engine = Engine::new(
            config.lua.clone(),
            &peer_dir,
            Identity {
                id: local_id.0.clone(),
                label: short_id(&local_id),
            },
            Some(Arc::clone(&db)),
        );
        if let Err(e) = engine.start_watch() {
            tracing::warn!("script watcher unavailable: {e}");
        }

        let node = Arc::new(Self {
            config,
            peer_dir,
            substrate,
            peers,
            entangle,
            mq,
            chat,
            presence,
            groups,
            engine,
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        node.spawn_accept_router(incoming_rx);
        node.spawn_link_bridge(link_rx);
        node.spawn_chat_router(chat_rx);
        node.spawn_peer_bridge();
        node.spawn_prune_tick();
        node.wire_mq_topics();
        node.presence.start(discovery_rx);

        let groups = Arc::clone(&node.groups);
        node.track(tokio::spawn(async move {
            groups.reconnect_subscriptions(RECONNECT_GRACE).await;
        }));

        tracing::info!(id = %node.substrate.local_id(), "node ready");
        Ok(node)
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Route accepted connections by protocol id.
    fn spawn_accept_router(self: &Arc<Self>, mut incoming_rx: mpsc::Receiver<IncomingConn>) {
        let node = Arc::clone(self);
        self.track(tokio::spawn(async move {
            while let Some(incoming) = incoming_rx.recv().await {
                node.peers.touch(&incoming.remote);
                if incoming.alpn == substrate::CHAT_ALPN {
                    let chat = Arc::clone(&node.chat);
                    tokio::spawn(async move { chat.handle_conn(incoming).await });
                } else if incoming.alpn == substrate::MQ_ALPN {
                    let mq = Arc::clone(&node.mq);
                    tokio::spawn(async move { mq.handle_conn(incoming).await });
                } else if incoming.alpn == substrate::ENTANGLE_ALPN {
                    node.entangle.handle_incoming(incoming);
                } else if incoming.alpn == substrate::GROUP_ALPN {
                    let groups = Arc::clone(&node.groups);
                    tokio::spawn(async move { groups.handle_group_conn(incoming).await });
                } else if incoming.alpn == substrate::INVITE_ALPN {
                    let groups = Arc::clone(&node.groups);
                    tokio::spawn(async move { groups.handle_invite_conn(incoming).await });
                } else {
                    tracing::warn!(alpn = ?incoming.alpn, "connection on unknown protocol");
                    incoming.conn.close(0u32.into(), b"unknown protocol");
                }
            }
        }));
    }

    /// Entangle stream state is the canonical source for `reachable`.
    fn spawn_link_bridge(self: &Arc<Self>, mut link_rx: mpsc::Receiver<LinkEvent>) {
        let node = Arc::clone(self);
        self.track(tokio::spawn(async move {
            while let Some(event) = link_rx.recv().await {
                match event {
                    LinkEvent::Up(peer) => {
                        node.peers.touch(&peer);
                        node.peers.set_reachable(&peer, true);
                    }
                    LinkEvent::Down(peer) => {
                        node.peers.set_reachable(&peer, false);
                    }
                }
            }
        }));
    }

    /// Peer-table events fan out to the UI topics and drive entangle dials.
    fn spawn_peer_bridge(self: &Arc<Self>) {
        let (handle, mut peer_rx) = self.peers.subscribe();
        let node = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let _handle = handle; // keep the subscription alive
            while let Some(event) = peer_rx.recv().await {
                match event {
                    PeerEvent::Update(peer) => {
                        if peer.is_online() {
                            node.entangle.connect(&peer.id);
                        }
                        let payload = serde_json::to_value(&peer).unwrap_or_default();
                        node.mq.local_publish("peer:announce", payload);
                    }
                    PeerEvent::Remove(id) => {
                        node.mq.local_publish("peer:gone", json!({ "id": id }));
                    }
                }
            }
        }));
    }

    /// Inbound chat: publish to listeners, dispatch `!commands`.
    fn spawn_chat_router(self: &Arc<Self>, mut chat_rx: mpsc::Receiver<ChatMessage>) {
        let node = Arc::clone(self);
        self.track(tokio::spawn(async move {
            while let Some(msg) = chat_rx.recv().await {
                node.peers.touch(&PeerId(msg.from.clone()));
                node.mq
                    .local_publish("chat", serde_json::to_value(&msg).unwrap_or_default());

                if let Some((command, args)) = msg.command() {
                    let node = Arc::clone(&node);
                    let command = command.to_string();
                    let args = args.to_string();
                    let from = PeerId(msg.from.clone());
                    tokio::spawn(async move {
                        let reply = node.run_command(&from, &command, &args).await;
                        if let Some(reply) = reply {
                            if let Err(e) =
                                node.chat.send(&from, ChatKind::Direct, reply, None).await
                            {
                                tracing::debug!(peer = %from, "command reply failed: {e}");
                            }
                        }
                    });
                }
            }
        }));
    }

    async fn run_command(&self, from: &PeerId, command: &str, args: &str) -> Option<String> {
        let caller = self.caller_identity(from);
        match self.engine.invoke_command(&caller, command, args).await {
            Ok(reply) => reply,
            Err(Error::NotFound(_)) => Some(format!("Unknown command: {command}")),
            Err(e) => Some(e.to_string()),
        }
    }

    /// MQ topic wiring: presence management and data-function calls.
    fn wire_mq_topics(self: &Arc<Self>) {
        let presence = Arc::clone(&self.presence);
        self.mq.core().subscribe_topic(
            "presence:",
            Arc::new(move |msg: MqMsg| {
                let presence = Arc::clone(&presence);
                Box::pin(async move {
                    presence.handle_message(msg);
                })
            }),
        );

        let node = Arc::clone(self);
        self.mq.core().subscribe_topic(
            "call:",
            Arc::new(move |msg: MqMsg| {
                let node = Arc::clone(&node);
                Box::pin(async move {
                    node.handle_call(msg).await;
                })
            }),
        );
    }

    /// A `call:<function>` message invokes a data function; the result goes
    /// back on `result:<request id>`.
    async fn handle_call(&self, msg: MqMsg) {
        let Some(name) = msg.topic.strip_prefix("call:").map(String::from) else {
            return;
        };
        let caller = self.caller_identity(&msg.from);
        let params = msg
            .payload
            .get("params")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let result = match self.engine.invoke_function(&caller, &name, params).await {
            Ok(value) => json!({ "value": value }),
            Err(e) => json!({ "error": e.to_string() }),
        };
        let reply_topic = format!("result:{}", msg.id);
        if let Err(e) = self.mq.send(&msg.from, reply_topic, result).await {
            tracing::debug!(peer = %msg.from, function = %name, "call reply failed: {e}");
        }
    }

    fn caller_identity(&self, peer: &PeerId) -> Identity {
        let label = self
            .peers
            .get(peer)
            .map(|p| p.profile.content)
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| short_id(peer));
        Identity {
            id: peer.0.clone(),
            label,
        }
    }

    /// Periodic TTL/grace sweep plus engine housekeeping.
    fn spawn_prune_tick(self: &Arc<Self>) {
        let node = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let ttl = Duration::from_secs(node.config.presence.ttl_seconds);
            let grace = Duration::from_secs(node.config.grace_seconds());
            let mut ticker = tokio::time::interval(Duration::from_secs(
                node.config.presence.heartbeat_seconds,
            ));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = SystemTime::now();
                node.peers.prune_stale(now - ttl, now - grace);
                node.engine.maintain();
            }
        }));
    }

    // ── Read-only surface for the viewer ───────────────────────────────

    pub fn local_id(&self) -> &PeerId {
        self.substrate.local_id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_dir(&self) -> &PathBuf {
        &self.peer_dir
    }

    pub fn peers_snapshot(&self) -> Vec<SeenPeer> {
        self.peers.snapshot()
    }

    pub fn chat_history(&self) -> Vec<ChatMessage> {
        self.chat.history()
    }

    pub fn hosted_groups(&self) -> Vec<(GroupInfo, Vec<String>)> {
        self.groups.hosted_snapshot()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.groups.subscriptions()
    }

    pub fn commands(&self) -> Vec<String> {
        self.engine.command_names()
    }

    pub fn functions(&self) -> Vec<String> {
        self.engine.function_names()
    }

    /// UI event feed: MQ listener (with inbox replay).
    pub fn listen_events(&self) -> (MqListenerHandle, mpsc::Receiver<MqMsg>) {
        self.mq.core().add_listener()
    }

    /// Group event feed.
    pub fn listen_groups(&self) -> (GroupListenerHandle, mpsc::Receiver<GroupEvent>) {
        self.groups.subscribe()
    }

    // ── Side-effect operations for the viewer ──────────────────────────

    pub async fn send_chat(
        &self,
        to: &PeerId,
        content: impl Into<String>,
    ) -> crate::error::Result<ChatMessage> {
        self.chat.send(to, ChatKind::Direct, content, None).await
    }

    pub async fn broadcast_chat(&self, content: &str) -> usize {
        let online = self.peers.online_ids();
        self.chat.broadcast(&online, content).await
    }

    pub async fn set_profile(&self, profile: PeerProfile) {
        self.presence.set_profile(profile).await;
    }

    pub async fn create_group(
        &self,
        name: &str,
        app_type: &str,
        max_members: u32,
        volatile: bool,
    ) -> crate::error::Result<GroupInfo> {
        self.groups
            .create_group(name, app_type, max_members, volatile)
            .await
    }

    pub fn close_group(&self, group_id: &str) -> crate::error::Result<()> {
        self.groups.close_group(group_id)
    }

    pub async fn join_group(
        &self,
        host: &PeerId,
        group_id: &str,
    ) -> crate::error::Result<Subscription> {
        self.groups.join_remote_group(host, group_id).await
    }

    pub async fn leave_group(&self, group_id: &str) -> crate::error::Result<()> {
        self.groups.unsubscribe(group_id).await
    }

    pub async fn send_to_group(
        &self,
        group_id: &str,
        payload: serde_json::Value,
        state: bool,
    ) -> crate::error::Result<()> {
        self.groups.send_to_group(group_id, payload, state).await
    }

    pub async fn invite(&self, peer: &PeerId, group_id: &str) -> crate::error::Result<()> {
        self.groups.send_invite(peer, group_id).await
    }

    /// Store a file shared into a group, under `shared/<group_id>/<file>`.
    pub fn save_shared_file(
        &self,
        group_id: &str,
        name: &str,
        bytes: &[u8],
    ) -> crate::error::Result<PathBuf> {
        let file_name = sanitize_file_name(name)?;
        let dir = self
            .peer_dir
            .join("shared")
            .join(sanitize_file_name(group_id)?);
        std::fs::create_dir_all(&dir).map_err(|e| Error::Invalid(format!("shared dir: {e}")))?;
        let path = dir.join(file_name);
        std::fs::write(&path, bytes).map_err(|e| Error::Invalid(format!("shared write: {e}")))?;
        Ok(path)
    }

    /// Names of the files shared into a group.
    pub fn list_shared_files(&self, group_id: &str) -> crate::error::Result<Vec<String>> {
        let dir = self
            .peer_dir
            .join("shared")
            .join(sanitize_file_name(group_id)?);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::Invalid(format!("shared dir: {e}"))),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Invoke a local data function directly (the viewer's JSON API path).
    pub async fn call_function(
        &self,
        name: &str,
        params: serde_json::Value,
    ) -> crate::error::Result<serde_json::Value> {
        let caller = Identity {
            id: self.local_id().0.clone(),
            label: short_id(self.local_id()),
        };
        self.engine.invoke_function(&caller, name, params).await
    }

    /// Orderly shutdown: goodbye, bridges, groups, entangle, endpoint.
    pub async fn shutdown(&self) {
        tracing::info!("node shutting down");
        self.presence.broadcast_gone().await;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.groups.shutdown().await;
        self.entangle.shutdown();
        self.substrate.close().await;
        tracing::info!("node stopped");
    }
}

/// Short display form of a peer id.
fn short_id(peer: &PeerId) -> String {
    peer.0[..8.min(peer.0.len())].to_string()
}

/// Reject names that could escape the shared directory.
fn sanitize_file_name(name: &str) -> crate::error::Result<&str> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(Error::Invalid(format!("bad file name: {name:?}")));
    }
    Ok(name)
}
