//! Red Envelope Engine (C8): pre-split "random cut" amount vectors, claim-or-expire
//! transactions, and a periodic expiry sweep.
//!
//! Grounded on `original_source/plugins/red_envelope/{models,service,messages}.py`: the
//! `_generate_random_distribution` cut-point algorithm, the `channel_index` sequencing,
//! and the "lucky king" announcement computed from the claim that drains
//! `remaining_count` to zero.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StarshardError};
use crate::ledger::Ledger;

const EXPIRE_SECONDS: i64 = 24 * 60 * 60;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Reserve 1 unit per recipient, then cut the remaining pool at `count-1` uniform random
/// points, floor each segment's proportional share, and hand the rounding remainder out
/// one unit at a time to random recipients before shuffling the final vector.
pub fn generate_random_distribution(total_amount: i64, count: i64) -> Result<Vec<i64>> {
    if count <= 0 || total_amount < count {
        return Err(StarshardError::InvalidArgument(
            "amount must be >= count and count must be positive".to_string(),
        ));
    }
    if count == 1 {
        return Ok(vec![total_amount]);
    }

    let mut rng = rand::thread_rng();
    let pool = total_amount - count;
    if pool <= 0 {
        return Ok(vec![1; count as usize]);
    }

    let mut cuts: Vec<f64> = (0..count - 1).map(|_| rng.gen::<f64>()).collect();
    cuts.sort_by(|a, b| a.partial_cmp(b).unwrap());

    let mut proportions = Vec::with_capacity(count as usize);
    let mut prev = 0.0;
    for cut in &cuts {
        proportions.push(cut - prev);
        prev = *cut;
    }
    proportions.push(1.0 - prev);

    let mut raw: Vec<i64> = proportions
        .iter()
        .map(|p| ((p * pool as f64) as i64).max(0))
        .collect();

    let remainder = pool - raw.iter().sum::<i64>();
    for _ in 0..remainder {
        let idx = rng.gen_range(0..count as usize);
        raw[idx] += 1;
    }

    let mut amounts: Vec<i64> = raw.into_iter().map(|a| a + 1).collect();
    use rand::seq::SliceRandom;
    amounts.shuffle(&mut rng);
    Ok(amounts)
}

#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: i64,
    pub creator_id: String,
    pub channel_id: String,
    pub channel_index: i64,
    pub title: String,
    pub total_amount: i64,
    pub remaining_amount: i64,
    pub total_count: i64,
    pub remaining_count: i64,
    pub created_at: i64,
    pub expires_at: i64,
    pub is_expired: bool,
}

impl Envelope {
    fn is_active(&self, now: i64) -> bool {
        !self.is_expired && self.remaining_count > 0 && self.expires_at > now
    }
}

#[derive(Debug, Clone)]
pub struct LuckyKing {
    pub creator_id: String,
    pub duration_seconds: i64,
    pub lucky_user_id: String,
    pub lucky_amount: i64,
}

#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub amount: i64,
    pub lucky_king: Option<LuckyKing>,
}

#[derive(Clone)]
pub struct RedEnvelopeEngine {
    ledger: Ledger,
    conn: Arc<Mutex<Connection>>,
}

impl RedEnvelopeEngine {
    pub fn open(data_dir: &Path, ledger: Ledger) -> Result<Self> {
        let dir = data_dir.join("red_envelope");
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("data.db"))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS red_envelopes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                creator_id TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                channel_index INTEGER NOT NULL,
                title TEXT NOT NULL,
                total_amount INTEGER NOT NULL,
                remaining_amount INTEGER NOT NULL,
                total_count INTEGER NOT NULL,
                remaining_count INTEGER NOT NULL,
                pending_amounts TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                is_expired INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS claim_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                envelope_id INTEGER NOT NULL,
                user_id TEXT NOT NULL,
                amount INTEGER NOT NULL,
                claimed_at INTEGER NOT NULL,
                UNIQUE(envelope_id, user_id)
            );",
        )?;
        Ok(RedEnvelopeEngine {
            ledger,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an envelope: precondition `amount >= count >= 1` and `creator.balance >=
    /// amount`, debit, pre-split, and persist.
    pub fn create(&self, creator_id: &str, channel_id: &str, title: &str, amount: i64, count: i64) -> Result<Envelope> {
        if count < 1 || amount < count {
            return Err(StarshardError::InvalidArgument(
                "amount must be >= count and count must be >= 1".to_string(),
            ));
        }
        let user = self.ledger.get_user(creator_id)?;
        if user.balance < amount {
            return Err(StarshardError::InsufficientBalance);
        }
        self.ledger.cost(creator_id, amount, "red_envelope_create")?;

        let pending = generate_random_distribution(amount, count)?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let channel_index: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(channel_index), 0) + 1 FROM red_envelopes WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .unwrap_or(1);
        conn.execute(
            "INSERT INTO red_envelopes
             (creator_id, channel_id, channel_index, title, total_amount, remaining_amount,
              total_count, remaining_count, pending_amounts, created_at, expires_at, is_expired)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, ?6, ?7, ?8, ?9, 0)",
            params![
                creator_id,
                channel_id,
                channel_index,
                title,
                amount,
                count,
                serde_json::to_string(&pending).unwrap(),
                now,
                now + EXPIRE_SECONDS,
            ],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Envelope {
            id,
            creator_id: creator_id.to_string(),
            channel_id: channel_id.to_string(),
            channel_index,
            title: title.to_string(),
            total_amount: amount,
            remaining_amount: amount,
            total_count: count,
            remaining_count: count,
            created_at: now,
            expires_at: now + EXPIRE_SECONDS,
            is_expired: false,
        })
    }

    fn row_to_envelope(row: &rusqlite::Row) -> rusqlite::Result<Envelope> {
        Ok(Envelope {
            id: row.get(0)?,
            creator_id: row.get(1)?,
            channel_id: row.get(2)?,
            channel_index: row.get(3)?,
            title: row.get(4)?,
            total_amount: row.get(5)?,
            remaining_amount: row.get(6)?,
            total_count: row.get(7)?,
            remaining_count: row.get(8)?,
            created_at: row.get(9)?,
            expires_at: row.get(10)?,
            is_expired: row.get::<_, i64>(11)? != 0,
        })
    }

    const ENVELOPE_COLUMNS: &'static str =
        "id, creator_id, channel_id, channel_index, title, total_amount, remaining_amount,
         total_count, remaining_count, created_at, expires_at, is_expired";

    pub fn list_active(&self, channel_id: &str) -> Result<Vec<Envelope>> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM red_envelopes
             WHERE channel_id = ?1 AND is_expired = 0 AND remaining_count > 0 AND expires_at > ?2
             ORDER BY created_at DESC",
            Self::ENVELOPE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![channel_id, now], Self::row_to_envelope)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn find_by_index(conn: &Connection, channel_id: &str, channel_index: i64) -> Result<Option<Envelope>> {
        let sql = format!(
            "SELECT {} FROM red_envelopes WHERE channel_id = ?1 AND channel_index = ?2",
            Self::ENVELOPE_COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![channel_id, channel_index], Self::row_to_envelope)
            .optional()?)
    }

    fn find_most_recent_active(conn: &Connection, channel_id: &str, now: i64) -> Result<Option<Envelope>> {
        let sql = format!(
            "SELECT {} FROM red_envelopes
             WHERE channel_id = ?1 AND is_expired = 0 AND remaining_count > 0 AND expires_at > ?2
             ORDER BY created_at DESC LIMIT 1",
            Self::ENVELOPE_COLUMNS
        );
        Ok(conn.query_row(&sql, params![channel_id, now], Self::row_to_envelope).optional()?)
    }

    fn expire_locked(&self, conn: &Connection, envelope: &Envelope) -> Result<i64> {
        if envelope.is_expired {
            return Ok(0);
        }
        let refund = envelope.remaining_amount.max(0);
        conn.execute(
            "UPDATE red_envelopes SET is_expired = 1, remaining_amount = 0, remaining_count = 0 WHERE id = ?1",
            params![envelope.id],
        )?;
        if refund > 0 {
            self.ledger.add(&envelope.creator_id, refund, &format!("red_envelope_refund_{}", envelope.id))?;
        }
        Ok(refund)
    }

    /// Resolve an envelope by explicit `channel_index`, or the most recently created
    /// active one if omitted, and claim the first pending amount atomically.
    pub fn claim(&self, user_id: &str, channel_id: &str, channel_index: Option<i64>) -> Result<ClaimOutcome> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();

        let envelope = match channel_index {
            Some(idx) => Self::find_by_index(&conn, channel_id, idx)?
                .ok_or_else(|| StarshardError::NotFound("red envelope".to_string()))?,
            None => Self::find_most_recent_active(&conn, channel_id, now)?
                .ok_or(StarshardError::Empty)?,
        };

        if envelope.is_expired || envelope.expires_at <= now {
            self.expire_locked(&conn, &envelope)?;
            return Err(StarshardError::Expired);
        }
        if envelope.remaining_count <= 0 || envelope.remaining_amount <= 0 {
            return Err(StarshardError::Empty);
        }

        let already: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM claim_records WHERE envelope_id = ?1 AND user_id = ?2",
                params![envelope.id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            return Err(StarshardError::AlreadyClaimed);
        }

        let pending_json: String = conn.query_row(
            "SELECT pending_amounts FROM red_envelopes WHERE id = ?1",
            params![envelope.id],
            |row| row.get(0),
        )?;
        let mut pending: Vec<i64> = serde_json::from_str(&pending_json).unwrap_or_default();
        if pending.is_empty() {
            return Err(StarshardError::Empty);
        }
        let amount = pending.remove(0);

        conn.execute(
            "UPDATE red_envelopes
             SET pending_amounts = ?1, remaining_amount = remaining_amount - ?2, remaining_count = remaining_count - 1
             WHERE id = ?3",
            params![serde_json::to_string(&pending).unwrap(), amount, envelope.id],
        )?;
        conn.execute(
            "INSERT INTO claim_records (envelope_id, user_id, amount, claimed_at) VALUES (?1, ?2, ?3, ?4)",
            params![envelope.id, user_id, amount, now],
        )?;

        let remaining_count: i64 = conn.query_row(
            "SELECT remaining_count FROM red_envelopes WHERE id = ?1",
            params![envelope.id],
            |row| row.get(0),
        )?;

        let lucky_king = if remaining_count == 0 {
            let (lucky_user, lucky_amount): (String, i64) = conn.query_row(
                "SELECT user_id, amount FROM claim_records WHERE envelope_id = ?1 ORDER BY amount DESC LIMIT 1",
                params![envelope.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Some(LuckyKing {
                creator_id: envelope.creator_id.clone(),
                duration_seconds: now - envelope.created_at,
                lucky_user_id: lucky_user,
                lucky_amount,
            })
        } else {
            None
        };
        drop(conn);

        self.ledger.add(user_id, amount, &format!("red_envelope_claim_{}", envelope.id))?;
        Ok(ClaimOutcome { amount, lucky_king })
    }

    /// Mark overdue envelopes expired and refund their remaining amounts; returns how
    /// many were swept.
    pub fn expire_overdue(&self) -> Result<usize> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM red_envelopes WHERE is_expired = 0 AND expires_at <= ?1",
            Self::ENVELOPE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now], Self::row_to_envelope)?;
        let mut overdue = Vec::new();
        for row in rows {
            overdue.push(row?);
        }
        drop(stmt);
        let count = overdue.len();
        for envelope in &overdue {
            self.expire_locked(&conn, envelope)?;
        }
        Ok(count)
    }
}

/// Detached periodic sweep matching `expire_overdue_envelopes`'s 5-minute cadence.
pub fn spawn_expiry_sweeper(engine: RedEnvelopeEngine) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            match engine.expire_overdue() {
                Ok(count) if count > 0 => log::info!("expired {count} overdue red envelopes"),
                Ok(_) => {}
                Err(e) => log::warn!("red envelope expiry sweep failed: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_ledger() -> Ledger {
        let dir = tempdir().unwrap();
        Ledger::open(dir.path()).unwrap()
    }

    #[test]
    fn distribution_sums_to_total_and_respects_minimum() {
        for _ in 0..50 {
            let amounts = generate_random_distribution(100, 7).unwrap();
            assert_eq!(amounts.len(), 7);
            assert_eq!(amounts.iter().sum::<i64>(), 100);
            assert!(amounts.iter().all(|&a| a >= 1));
        }
    }

    #[test]
    fn distribution_rejects_amount_below_count() {
        assert!(generate_random_distribution(3, 5).is_err());
    }

    #[test]
    fn single_recipient_gets_everything() {
        assert_eq!(generate_random_distribution(42, 1).unwrap(), vec![42]);
    }

    #[test]
    fn create_and_claim_moves_balance_and_tracks_remaining() {
        let ledger = test_ledger();
        ledger.add("creator", 1000, "seed").unwrap();
        let dir = tempdir().unwrap();
        let engine = RedEnvelopeEngine::open(dir.path(), ledger.clone()).unwrap();

        let envelope = engine.create("creator", "chan1", "hi", 100, 3).unwrap();
        assert_eq!(ledger.get_user("creator").unwrap().balance, 900);

        let outcome = engine.claim("u1", "chan1", Some(envelope.channel_index)).unwrap();
        assert!(outcome.amount >= 1);
        assert!(ledger.get_user("u1").unwrap().balance >= 1);
    }

    #[test]
    fn claiming_twice_is_rejected() {
        let ledger = test_ledger();
        ledger.add("creator", 1000, "seed").unwrap();
        let dir = tempdir().unwrap();
        let engine = RedEnvelopeEngine::open(dir.path(), ledger).unwrap();
        let envelope = engine.create("creator", "chan1", "hi", 100, 3).unwrap();
        engine.claim("u1", "chan1", Some(envelope.channel_index)).unwrap();
        let err = engine.claim("u1", "chan1", Some(envelope.channel_index)).unwrap_err();
        assert_eq!(err.kind(), "already_claimed");
    }

    #[test]
    fn draining_the_last_claim_reports_a_lucky_king() {
        let ledger = test_ledger();
        ledger.add("creator", 1000, "seed").unwrap();
        let dir = tempdir().unwrap();
        let engine = RedEnvelopeEngine::open(dir.path(), ledger).unwrap();
        let envelope = engine.create("creator", "chan1", "hi", 10, 2).unwrap();
        let first = engine.claim("u1", "chan1", Some(envelope.channel_index)).unwrap();
        assert!(first.lucky_king.is_none());
        let second = engine.claim("u2", "chan1", Some(envelope.channel_index)).unwrap();
        assert!(second.lucky_king.is_some());
    }
}
