//! Node configuration.
//!
//! A single JSON document (`config.json`) loaded from the peer directory.
//! Unknown keys are rejected so typos fail loudly at startup instead of
//! silently running with defaults. The `viewer` section is validated here
//! but consumed only by the external viewer collaborator.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// File name of the config document inside the peer directory.
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub identity: IdentityConfig,
    pub paths: PathsConfig,
    pub p2p: P2pConfig,
    pub presence: PresenceConfig,
    pub lua: LuaConfig,
    pub viewer: ViewerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IdentityConfig {
    /// Location of the persistent identity material, relative to the peer dir.
    pub key_file: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("identity.key"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    pub site_root: PathBuf,
    pub site_source: PathBuf,
    pub site_stage: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            site_root: PathBuf::from("site"),
            site_source: PathBuf::from("site/source"),
            site_stage: PathBuf::from("site/stage"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct P2pConfig {
    /// 0 = ephemeral port.
    pub listen_port: u16,
    /// LAN discovery cohort. Announces with a different tag are ignored.
    pub mdns_tag: String,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            mdns_tag: "goop".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PresenceConfig {
    /// Presence gossip topic.
    pub topic: String,
    /// Seconds without contact before a peer goes offline.
    pub ttl_seconds: u64,
    /// Announce interval. Must be shorter than the TTL.
    pub heartbeat_seconds: u64,
    /// Optional rendezvous server to join (host name or address).
    pub rendezvous_host: Option<String>,
    pub rendezvous_port: u16,
    /// Bind address for a locally hosted rendezvous server (consumed by the
    /// rendezvous collaborator, validated here).
    pub rendezvous_bind: Option<String>,
    /// Advertise WAN reachability to the rendezvous server.
    pub rendezvous_wan: bool,
    /// Skip LAN multicast and rely on rendezvous only.
    pub rendezvous_only: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            topic: "goop:presence".to_string(),
            ttl_seconds: 90,
            heartbeat_seconds: 30,
            rendezvous_host: None,
            rendezvous_port: 4888,
            rendezvous_bind: None,
            rendezvous_wan: false,
            rendezvous_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LuaConfig {
    pub enabled: bool,
    /// Script root, relative to the peer dir. Chat commands live at the top
    /// level, data functions under `functions/`.
    pub script_dir: PathBuf,
    /// Per-invocation wall-clock budget, 1–60 s.
    pub timeout_seconds: u64,
    /// Per-invocation interpreter heap cap.
    pub max_memory_mb: u64,
    pub rate_limit_per_peer: u32,
    pub rate_limit_global: u32,
    pub http_enabled: bool,
    pub kv_enabled: bool,
}

impl Default for LuaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            script_dir: PathBuf::from("site/lua"),
            timeout_seconds: 5,
            max_memory_mb: 64,
            rate_limit_per_peer: 10,
            rate_limit_global: 60,
            http_enabled: true,
            kv_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ViewerConfig {
    pub http_addr: String,
    pub theme: String,
    pub debug: bool,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            http_addr: "127.0.0.1:4880".to_string(),
            theme: "default".to_string(),
            debug: false,
        }
    }
}

impl Config {
    /// Load `config.json` from the peer directory. A missing file yields the
    /// defaults; a malformed or invalid one is an error.
    pub fn load(peer_dir: &Path) -> Result<Self> {
        let path = peer_dir.join(CONFIG_FILE);
        let config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| Error::Invalid(format!("read {}: {e}", path.display())))?;
            serde_json::from_str::<Config>(&raw)
                .map_err(|e| Error::Invalid(format!("parse {}: {e}", path.display())))?
        } else {
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.presence.ttl_seconds == 0 {
            return Err(Error::Invalid("presence.ttl_seconds must be > 0".into()));
        }
        if self.presence.heartbeat_seconds == 0 {
            return Err(Error::Invalid(
                "presence.heartbeat_seconds must be > 0".into(),
            ));
        }
        if self.presence.heartbeat_seconds >= self.presence.ttl_seconds {
            return Err(Error::Invalid(format!(
                "presence.heartbeat_seconds ({}) must be shorter than presence.ttl_seconds ({})",
                self.presence.heartbeat_seconds, self.presence.ttl_seconds
            )));
        }
        if self.presence.topic.is_empty() {
            return Err(Error::Invalid("presence.topic must not be empty".into()));
        }
        if self.paths.site_source == self.paths.site_stage {
            return Err(Error::Invalid(
                "paths.site_source and paths.site_stage must differ".into(),
            ));
        }
        if !(1..=60).contains(&self.lua.timeout_seconds) {
            return Err(Error::Invalid(format!(
                "lua.timeout_seconds must be within 1..=60, got {}",
                self.lua.timeout_seconds
            )));
        }
        if self.lua.max_memory_mb == 0 {
            return Err(Error::Invalid("lua.max_memory_mb must be > 0".into()));
        }
        if self.presence.rendezvous_host.is_some() && self.presence.rendezvous_port == 0 {
            return Err(Error::Invalid(
                "presence.rendezvous_port must be set when joining a rendezvous server".into(),
            ));
        }
        if self.presence.rendezvous_only && self.presence.rendezvous_host.is_none() {
            return Err(Error::Invalid(
                "presence.rendezvous_only requires presence.rendezvous_host".into(),
            ));
        }
        Ok(())
    }

    /// Six TTLs: how long an offline entry is browsable before pruning.
    pub fn grace_seconds(&self) -> u64 {
        self.presence.ttl_seconds * 6
    }
}
