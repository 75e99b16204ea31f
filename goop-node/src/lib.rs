//! Goop node runtime.
//!
//! A peer-to-peer presence node: every participant runs one of these. It
//! owns a cryptographic identity, tracks other peers in a soft-state table,
//! keeps one heartbeat stream per peer for instant disconnect detection,
//! moves application traffic over an ack'd unicast transport and
//! host-relayed groups, and runs sandboxed Lua on behalf of peers.
//!
//! The node is ephemeral: when it stops, its content is gone.
//! The HTTP viewer and UI clients are external collaborators consuming
//! [`node::Node`]'s snapshots, listeners, and operations.

pub mod chat;
pub mod config;
pub mod db;
pub mod entangle;
pub mod error;
pub mod group;
pub mod identity;
pub mod limiter;
pub mod mq;
pub mod msgid;
pub mod node;
pub mod peers;
pub mod presence;
pub mod ring;
pub mod script;
pub mod substrate;

pub use error::{Error, Result};
pub use node::Node;
pub use peers::PeerId;
