//! Channel Membership (C10): a channel↔member many-to-many bag with a cached avatar URL,
//! updated on every inbound message and join/leave/guild-removed event.
//!
//! Grounded on `original_source/plugins/channels/data_source.py`'s `ChannelMemberManager`
//! (a SQLAlchemy many-to-many association table), re-expressed as a SQLite junction
//! table since this crate keeps one connection per subsystem rather than an ORM session.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::Result;

#[derive(Clone)]
pub struct ChannelMembers {
    conn: Arc<Mutex<Connection>>,
}

impl ChannelMembers {
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("channels");
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("channels.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS members (
                id TEXT PRIMARY KEY,
                avatar_url TEXT
            );
            CREATE TABLE IF NOT EXISTS channel_members (
                channel_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                PRIMARY KEY (channel_id, member_id)
            );",
        )?;
        Ok(ChannelMembers {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Record `member_id` as present in `channel_id`, refreshing their cached avatar.
    /// Called on every inbound message and on join-style notice events.
    pub fn add_member(&self, channel_id: &str, member_id: &str, avatar_url: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO members (id, avatar_url) VALUES (?1, ?2)
             ON CONFLICT(id) DO UPDATE SET avatar_url = excluded.avatar_url",
            params![member_id, avatar_url],
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO channel_members (channel_id, member_id) VALUES (?1, ?2)",
            params![channel_id, member_id],
        )?;
        Ok(())
    }

    pub fn remove_member(&self, channel_id: &str, member_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM channel_members WHERE channel_id = ?1 AND member_id = ?2",
            params![channel_id, member_id],
        )?;
        Ok(affected > 0)
    }

    /// Drop a channel (e.g. on a guild-removed event) and its membership rows; member
    /// records themselves are left intact since they may belong to other channels.
    pub fn remove_channel(&self, channel_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM channel_members WHERE channel_id = ?1", params![channel_id])?;
        Ok(())
    }

    pub fn get_channel_members(&self, channel_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT member_id FROM channel_members WHERE channel_id = ?1")?;
        let rows = stmt.query_map(params![channel_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_member_channels(&self, member_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT channel_id FROM channel_members WHERE member_id = ?1")?;
        let rows = stmt.query_map(params![member_id], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_member_is_idempotent_and_refreshes_avatar() {
        let dir = tempdir().unwrap();
        let members = ChannelMembers::open(dir.path()).unwrap();
        members.add_member("c1", "u1", Some("old.png")).unwrap();
        members.add_member("c1", "u1", Some("new.png")).unwrap();
        assert_eq!(members.get_channel_members("c1").unwrap(), vec!["u1".to_string()]);
    }

    #[test]
    fn remove_member_drops_them_from_the_channel() {
        let dir = tempdir().unwrap();
        let members = ChannelMembers::open(dir.path()).unwrap();
        members.add_member("c1", "u1", None).unwrap();
        assert!(members.remove_member("c1", "u1").unwrap());
        assert!(members.get_channel_members("c1").unwrap().is_empty());
    }

    #[test]
    fn remove_channel_clears_all_its_members() {
        let dir = tempdir().unwrap();
        let members = ChannelMembers::open(dir.path()).unwrap();
        members.add_member("c1", "u1", None).unwrap();
        members.add_member("c1", "u2", None).unwrap();
        members.remove_channel("c1").unwrap();
        assert!(members.get_channel_members("c1").unwrap().is_empty());
    }

    #[test]
    fn get_member_channels_reflects_memberships_across_channels() {
        let dir = tempdir().unwrap();
        let members = ChannelMembers::open(dir.path()).unwrap();
        members.add_member("c1", "u1", None).unwrap();
        members.add_member("c2", "u1", None).unwrap();
        let mut channels = members.get_member_channels("u1").unwrap();
        channels.sort();
        assert_eq!(channels, vec!["c1".to_string(), "c2".to_string()]);
    }
}
