//! SQLite persistence layer.
//!
//! Stores hosted group records, their last-known member lists, and the
//! client-side group subscriptions used for reconnection after restart.
//! Uses WAL mode for concurrent reads during writes.
//!
//! Volatile groups never touch this layer; everything else survives restarts
//! so the viewer can browse membership while a host is offline.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{params, Connection, Result as SqlResult};

use crate::group::{GroupInfo, Subscription};
use crate::peers::PeerId;

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS groups (
                id          TEXT PRIMARY KEY,
                name        TEXT NOT NULL,
                app_type    TEXT NOT NULL,
                max_members INTEGER NOT NULL DEFAULT 0,
                host_joined INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS group_members (
                group_id  TEXT NOT NULL,
                peer_id   TEXT NOT NULL,
                joined_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, peer_id)
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                group_id TEXT PRIMARY KEY,
                host     TEXT NOT NULL,
                name     TEXT NOT NULL,
                app_type TEXT NOT NULL,
                volatile INTEGER NOT NULL DEFAULT 0,
                role     TEXT NOT NULL DEFAULT 'member'
            );
            ",
        )?;
        Ok(())
    }

    // ── Hosted groups ──────────────────────────────────────────────────

    /// Save or update a hosted group record.
    pub fn save_group(&self, g: &GroupInfo) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO groups (id, name, app_type, max_members, host_joined, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name,
                app_type=excluded.app_type,
                max_members=excluded.max_members,
                host_joined=excluded.host_joined",
            params![
                g.id,
                g.name,
                g.app_type,
                g.max_members as i64,
                g.host_joined as i32,
                g.created_at as i64,
            ],
        )?;
        Ok(())
    }

    /// Delete a group and its member list.
    pub fn delete_group(&self, id: &str) -> SqlResult<()> {
        self.conn
            .execute("DELETE FROM groups WHERE id = ?1", params![id])?;
        self.conn
            .execute("DELETE FROM group_members WHERE group_id = ?1", params![id])?;
        Ok(())
    }

    /// Load all persisted group records.
    pub fn load_groups(&self) -> SqlResult<Vec<GroupInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, app_type, max_members, host_joined, created_at FROM groups",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GroupInfo {
                id: row.get(0)?,
                name: row.get(1)?,
                app_type: row.get(2)?,
                max_members: row.get::<_, i64>(3)? as u32,
                volatile: false,
                host_joined: row.get::<_, i32>(4)? != 0,
                created_at: row.get::<_, i64>(5)? as u64,
            })
        })?;
        rows.collect()
    }

    /// Replace the last-known member list for a group.
    pub fn save_members(&self, group_id: &str, members: &HashMap<PeerId, u64>) -> SqlResult<()> {
        self.conn.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group_id],
        )?;
        let mut stmt = self.conn.prepare(
            "INSERT INTO group_members (group_id, peer_id, joined_at) VALUES (?1, ?2, ?3)",
        )?;
        for (peer, joined_at) in members {
            stmt.execute(params![group_id, peer.as_str(), *joined_at as i64])?;
        }
        Ok(())
    }

    /// Load the last-known member list for a group, peer → joined_at.
    pub fn load_members(&self, group_id: &str) -> SqlResult<HashMap<PeerId, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT peer_id, joined_at FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![group_id], |row| {
            let peer: String = row.get(0)?;
            let joined_at: i64 = row.get(1)?;
            Ok((PeerId(peer), joined_at as u64))
        })?;
        rows.collect()
    }

    // ── Subscriptions ──────────────────────────────────────────────────

    /// Save or update a client-side subscription.
    pub fn save_subscription(&self, s: &Subscription) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO subscriptions (group_id, host, name, app_type, volatile, role)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(group_id) DO UPDATE SET
                host=excluded.host,
                name=excluded.name,
                app_type=excluded.app_type,
                volatile=excluded.volatile,
                role=excluded.role",
            params![
                s.group_id,
                s.host.as_str(),
                s.name,
                s.app_type,
                s.volatile as i32,
                s.role,
            ],
        )?;
        Ok(())
    }

    pub fn delete_subscription(&self, group_id: &str) -> SqlResult<()> {
        self.conn.execute(
            "DELETE FROM subscriptions WHERE group_id = ?1",
            params![group_id],
        )?;
        Ok(())
    }

    pub fn load_subscriptions(&self) -> SqlResult<Vec<Subscription>> {
        let mut stmt = self
            .conn
            .prepare("SELECT group_id, host, name, app_type, volatile, role FROM subscriptions")?;
        let rows = stmt.query_map([], |row| {
            Ok(Subscription {
                group_id: row.get(0)?,
                host: PeerId(row.get(1)?),
                name: row.get(2)?,
                app_type: row.get(3)?,
                volatile: row.get::<_, i32>(4)? != 0,
                role: row.get(5)?,
            })
        })?;
        rows.collect()
    }

    /// Raw access for the script engine's `db` facility.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
