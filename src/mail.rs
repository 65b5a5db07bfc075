//! Mail Dispatcher (C9): direct and broadcast mail, scheduled dispatch, and a daily
//! expiry sweep.
//!
//! Grounded on `original_source/plugins/mailbox/{models,service,scheduled_service}.py`:
//! a `mails` template row plus per-recipient `mail_recipients` rows, lazily materialized
//! for broadcast mail on first list, and a `scheduled_mails` table polled every 5
//! seconds whose `recipients` column is either `"all"` or a comma-separated id list.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::error::{Result, StarshardError};
use crate::ledger::Ledger;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const DISPATCH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MailView {
    pub recipient_row_id: i64,
    pub mail_id: i64,
    pub title: String,
    pub content: String,
    pub star_shards: i64,
    pub sender_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_broadcast: bool,
    pub is_read: bool,
    pub read_at: Option<i64>,
}

#[derive(Clone)]
pub struct MailDispatcher {
    ledger: Ledger,
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl MailDispatcher {
    pub fn open(data_dir: &Path, ledger: Ledger) -> Result<Self> {
        let dir = data_dir.join("mailbox");
        std::fs::create_dir_all(&dir)?;
        let conn = rusqlite::Connection::open(dir.join("mailbox.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                star_shards INTEGER NOT NULL DEFAULT 0,
                expire_days INTEGER NOT NULL DEFAULT 7,
                created_at INTEGER NOT NULL,
                sender_id TEXT NOT NULL,
                is_broadcast INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS mail_recipients (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                mail_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                is_read INTEGER NOT NULL DEFAULT 0,
                read_at INTEGER
            );
            CREATE TABLE IF NOT EXISTS scheduled_mails (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                recipients TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                star_shards INTEGER NOT NULL DEFAULT 0,
                expire_days INTEGER NOT NULL DEFAULT 7,
                scheduled_time INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                is_sent INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER
            );",
        )?;
        Ok(MailDispatcher {
            ledger,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Send mail to one recipient: one template row, one recipient row.
    pub fn send_direct(&self, recipient_id: &str, title: &str, content: &str, star_shards: i64, expire_days: i64, sender_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO mails (title, content, star_shards, expire_days, created_at, sender_id, is_broadcast)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![title, content, star_shards, expire_days, now, sender_id],
        )?;
        let mail_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO mail_recipients (mail_id, user_id) VALUES (?1, ?2)",
            params![mail_id, recipient_id],
        )?;
        Ok(mail_id)
    }

    /// Send broadcast mail: template row only. Per-user recipient rows are materialized
    /// lazily the first time each user lists their mail.
    pub fn send_broadcast(&self, title: &str, content: &str, star_shards: i64, expire_days: i64, sender_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO mails (title, content, star_shards, expire_days, created_at, sender_id, is_broadcast)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            params![title, content, star_shards, expire_days, now, sender_id],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// List non-expired mail for `user_id`, materializing recipient rows for any
    /// not-yet-seen broadcast mail first, newest-first.
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<MailView>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();

        let mut stmt = conn.prepare(
            "SELECT id FROM mails WHERE is_broadcast = 1 AND created_at + expire_days * 86400 > ?1",
        )?;
        let broadcast_ids: Vec<i64> = stmt
            .query_map(params![now], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        for mail_id in broadcast_ids {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM mail_recipients WHERE mail_id = ?1 AND user_id = ?2",
                    params![mail_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                conn.execute(
                    "INSERT INTO mail_recipients (mail_id, user_id) VALUES (?1, ?2)",
                    params![mail_id, user_id],
                )?;
            }
        }

        let mut stmt = conn.prepare(
            "SELECT r.id, m.id, m.title, m.content, m.star_shards, m.sender_id, m.created_at,
                    m.created_at + m.expire_days * 86400, m.is_broadcast, r.is_read, r.read_at
             FROM mail_recipients r JOIN mails m ON r.mail_id = m.id
             WHERE r.user_id = ?1 AND m.created_at + m.expire_days * 86400 > ?2
             ORDER BY m.created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id, now], |row| {
            Ok(MailView {
                recipient_row_id: row.get(0)?,
                mail_id: row.get(1)?,
                title: row.get(2)?,
                content: row.get(3)?,
                star_shards: row.get(4)?,
                sender_id: row.get(5)?,
                created_at: row.get(6)?,
                expires_at: row.get(7)?,
                is_broadcast: row.get::<_, i64>(8)? != 0,
                is_read: row.get::<_, i64>(9)? != 0,
                read_at: row.get(10)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Read one mail by its recipient-row id: flips `is_read`, credits `star_shards`
    /// exactly once (idempotent on a second read).
    pub fn read_mail(&self, user_id: &str, recipient_row_id: i64) -> Result<MailView> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        let view = conn
            .query_row(
                "SELECT r.id, m.id, m.title, m.content, m.star_shards, m.sender_id, m.created_at,
                        m.created_at + m.expire_days * 86400, m.is_broadcast, r.is_read, r.read_at
                 FROM mail_recipients r JOIN mails m ON r.mail_id = m.id
                 WHERE r.id = ?1 AND r.user_id = ?2",
                params![recipient_row_id, user_id],
                |row| {
                    Ok(MailView {
                        recipient_row_id: row.get(0)?,
                        mail_id: row.get(1)?,
                        title: row.get(2)?,
                        content: row.get(3)?,
                        star_shards: row.get(4)?,
                        sender_id: row.get(5)?,
                        created_at: row.get(6)?,
                        expires_at: row.get(7)?,
                        is_broadcast: row.get::<_, i64>(8)? != 0,
                        is_read: row.get::<_, i64>(9)? != 0,
                        read_at: row.get(10)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StarshardError::NotFound("mail".to_string()))?;

        if view.expires_at <= now {
            return Err(StarshardError::Expired);
        }

        let already_read = view.is_read;
        if !already_read {
            conn.execute(
                "UPDATE mail_recipients SET is_read = 1, read_at = ?1 WHERE id = ?2",
                params![now, recipient_row_id],
            )?;
        }
        drop(conn);

        if !already_read && view.star_shards > 0 {
            self.ledger.add(user_id, view.star_shards, &format!("mail_reward_{}", view.mail_id))?;
        }

        Ok(MailView {
            is_read: true,
            read_at: Some(now),
            ..view
        })
    }

    /// Delete every mail whose window has elapsed, cascading to its recipient rows.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().timestamp();
        let mut stmt = conn.prepare("SELECT id FROM mails WHERE created_at + expire_days * 86400 <= ?1")?;
        let expired_ids: Vec<i64> = stmt.query_map(params![now], |row| row.get(0))?.collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        for mail_id in &expired_ids {
            conn.execute("DELETE FROM mail_recipients WHERE mail_id = ?1", params![mail_id])?;
            conn.execute("DELETE FROM mails WHERE id = ?1", params![mail_id])?;
        }
        Ok(expired_ids.len())
    }

    /// Create a scheduled mail; `name` must be unique, `recipients` is `"all"` or a
    /// comma-separated user-id list.
    pub fn create_scheduled(
        &self,
        name: &str,
        recipients: &str,
        title: &str,
        content: &str,
        star_shards: i64,
        expire_days: i64,
        scheduled_time: i64,
        created_by: &str,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<i64> = conn
            .query_row("SELECT 1 FROM scheduled_mails WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(StarshardError::InvalidArgument(format!("scheduled mail name '{name}' already exists")));
        }
        let now = Utc::now().timestamp();
        conn.execute(
            "INSERT INTO scheduled_mails
             (name, recipients, title, content, star_shards, expire_days, scheduled_time, created_at, created_by, is_sent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![name, recipients, title, content, star_shards, expire_days, scheduled_time, now, created_by],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Edit a not-yet-sent scheduled mail's fields (`None` leaves a field unchanged).
    pub fn update_scheduled(&self, name: &str, title: Option<&str>, content: Option<&str>, scheduled_time: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let is_sent: i64 = conn
            .query_row("SELECT is_sent FROM scheduled_mails WHERE name = ?1", params![name], |row| row.get(0))
            .optional()?
            .ok_or_else(|| StarshardError::NotFound("scheduled mail".to_string()))?;
        if is_sent != 0 {
            return Err(StarshardError::InvalidArgument("scheduled mail already sent".to_string()));
        }
        if let Some(t) = title {
            conn.execute("UPDATE scheduled_mails SET title = ?1 WHERE name = ?2", params![t, name])?;
        }
        if let Some(c) = content {
            conn.execute("UPDATE scheduled_mails SET content = ?1 WHERE name = ?2", params![c, name])?;
        }
        if let Some(st) = scheduled_time {
            conn.execute("UPDATE scheduled_mails SET scheduled_time = ?1 WHERE name = ?2", params![st, name])?;
        }
        Ok(())
    }

    /// Delete a scheduled mail regardless of its sent state.
    pub fn delete_scheduled(&self, name: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute("DELETE FROM scheduled_mails WHERE name = ?1", params![name])?;
        Ok(affected > 0)
    }

    /// Dispatch every scheduled mail whose `scheduled_time` has elapsed and is not yet
    /// sent; returns how many fired.
    pub fn dispatch_due(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        struct Due {
            name: String,
            recipients: String,
            title: String,
            content: String,
            star_shards: i64,
            expire_days: i64,
            created_by: String,
        }
        let due: Vec<Due> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT name, recipients, title, content, star_shards, expire_days, created_by
                 FROM scheduled_mails WHERE scheduled_time <= ?1 AND is_sent = 0",
            )?;
            let rows = stmt.query_map(params![now], |row| {
                Ok(Due {
                    name: row.get(0)?,
                    recipients: row.get(1)?,
                    title: row.get(2)?,
                    content: row.get(3)?,
                    star_shards: row.get(4)?,
                    expire_days: row.get(5)?,
                    created_by: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            out
        };

        let mut dispatched = 0;
        for mail in &due {
            if mail.recipients.eq_ignore_ascii_case("all") {
                self.send_broadcast(&mail.title, &mail.content, mail.star_shards, mail.expire_days, &mail.created_by)?;
            } else {
                for recipient_id in mail.recipients.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
                    self.send_direct(recipient_id, &mail.title, &mail.content, mail.star_shards, mail.expire_days, &mail.created_by)?;
                }
            }
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE scheduled_mails SET is_sent = 1, sent_at = ?1 WHERE name = ?2",
                params![Utc::now().timestamp(), mail.name],
            )?;
            dispatched += 1;
        }
        Ok(dispatched)
    }
}

/// Every 5 seconds, dispatch due scheduled mail. Every 24 hours, sweep expired mail.
pub fn spawn_mail_jobs(dispatcher: MailDispatcher) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_cleanup = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(DISPATCH_INTERVAL).await;
            match dispatcher.dispatch_due() {
                Ok(count) if count > 0 => log::info!("dispatched {count} scheduled mails"),
                Ok(_) => {}
                Err(e) => log::warn!("scheduled mail dispatch failed: {e}"),
            }
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                last_cleanup = tokio::time::Instant::now();
                match dispatcher.cleanup_expired() {
                    Ok(count) if count > 0 => log::info!("cleaned up {count} expired mails"),
                    Ok(_) => {}
                    Err(e) => log::warn!("mail cleanup failed: {e}"),
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_dispatcher() -> MailDispatcher {
        let ledger_dir = tempdir().unwrap();
        let ledger = Ledger::open(ledger_dir.path()).unwrap();
        let mail_dir = tempdir().unwrap();
        MailDispatcher::open(mail_dir.path(), ledger).unwrap()
    }

    #[test]
    fn direct_mail_is_visible_only_to_its_recipient() {
        let dispatcher = test_dispatcher();
        dispatcher.send_direct("u1", "hi", "body", 0, 7, "system").unwrap();
        assert_eq!(dispatcher.list_for_user("u1").unwrap().len(), 1);
        assert_eq!(dispatcher.list_for_user("u2").unwrap().len(), 0);
    }

    #[test]
    fn broadcast_mail_materializes_on_first_list() {
        let dispatcher = test_dispatcher();
        dispatcher.send_broadcast("news", "body", 5, 7, "system").unwrap();
        let first = dispatcher.list_for_user("u1").unwrap();
        assert_eq!(first.len(), 1);
        let second = dispatcher.list_for_user("u1").unwrap();
        assert_eq!(second.len(), 1, "materialization must not duplicate the recipient row");
    }

    #[test]
    fn reading_mail_credits_reward_exactly_once() {
        let dispatcher = test_dispatcher();
        dispatcher.send_direct("u1", "gift", "body", 10, 7, "system").unwrap();
        let row_id = dispatcher.list_for_user("u1").unwrap()[0].recipient_row_id;
        dispatcher.read_mail("u1", row_id).unwrap();
        assert_eq!(dispatcher.ledger.get_user("u1").unwrap().balance, 10);
        dispatcher.read_mail("u1", row_id).unwrap();
        assert_eq!(dispatcher.ledger.get_user("u1").unwrap().balance, 10);
    }

    #[test]
    fn scheduled_mail_name_must_be_unique() {
        let dispatcher = test_dispatcher();
        dispatcher.create_scheduled("promo", "all", "t", "c", 0, 7, 0, "admin").unwrap();
        let err = dispatcher.create_scheduled("promo", "all", "t", "c", 0, 7, 0, "admin").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn dispatch_due_fans_out_to_comma_separated_recipients() {
        let dispatcher = test_dispatcher();
        dispatcher.create_scheduled("batch", "u1,u2", "t", "c", 0, 7, 0, "admin").unwrap();
        let count = dispatcher.dispatch_due().unwrap();
        assert_eq!(count, 1);
        assert_eq!(dispatcher.list_for_user("u1").unwrap().len(), 1);
        assert_eq!(dispatcher.list_for_user("u2").unwrap().len(), 1);
    }
}
