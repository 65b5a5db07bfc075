//! The monetary ledger (C1): balances, levels, the append-only transaction log, daily
//! check-in idempotency, atomic transfer, rank queries, and nicknames.
//!
//! Grounded on `src/tmush/storage.rs`'s currency methods (`transfer_currency`,
//! `grant_currency`, `deduct_currency`): validate, mutate the record, persist, append a
//! transaction row. Backed by two SQLite files per `original_source/plugins/monetary/
//! database.py`'s `data.db`/`transaction.db` split, each behind its own
//! `rusqlite::Connection`. A single `std::sync::Mutex` guards both connections together
//! so every mutating call is one serialized critical section — the "single-writer
//! policy" option named in the concurrency model, chosen because two separate SQLite
//! files cannot share one native transaction.

use std::path::Path;
use std::sync::Mutex;

use chrono::{Local, TimeZone, Utc};
use rand::Rng;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StarshardError};

/// A user's ledger record. Auto-created with defaults on first read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub user_id: String,
    pub balance: i64,
    pub level: i64,
    pub last_daily: i64,
}

/// Transaction category, `signed()` per the universal balance invariant (§8.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxCategory {
    Income,
    Expense,
    Transfer,
    Set,
}

impl TxCategory {
    fn as_str(self) -> &'static str {
        match self {
            TxCategory::Income => "income",
            TxCategory::Expense => "expense",
            TxCategory::Transfer => "transfer",
            TxCategory::Set => "set",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "income" => TxCategory::Income,
            "expense" => TxCategory::Expense,
            "transfer" => TxCategory::Transfer,
            _ => TxCategory::Set,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: i64,
    pub user_id: String,
    pub category: TxCategory,
    pub amount: i64,
    pub time: i64,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct RankInfo {
    pub rank: i64,
    pub distance_to_next_rank: i64,
    pub distance_to_next_level: i64,
}

struct Inner {
    data: Connection,
    transactions: Connection,
}

/// Cheap-clone store handle over the two ledger connections.
#[derive(Clone)]
pub struct Ledger {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl Ledger {
    /// Open (creating if needed) `monetary/data.db` and `monetary/transaction.db` under
    /// `data_dir`, running schema migrations.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir.join("monetary"))?;
        let data = Connection::open(data_dir.join("monetary").join("data.db"))?;
        let transactions = Connection::open(data_dir.join("monetary").join("transaction.db"))?;

        data.execute_batch(
            "CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0,
                last_daily_time INTEGER NOT NULL DEFAULT 0,
                level INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS nicknames (
                user_id TEXT PRIMARY KEY,
                nickname TEXT UNIQUE NOT NULL,
                set_count INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        migrate_add_level_column(&data)?;

        transactions.execute_batch(
            "CREATE TABLE IF NOT EXISTS transactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                category TEXT NOT NULL,
                amount INTEGER NOT NULL,
                time INTEGER NOT NULL,
                description TEXT NOT NULL
            );",
        )?;

        Ok(Ledger {
            inner: std::sync::Arc::new(Mutex::new(Inner { data, transactions })),
        })
    }

    fn log_tx(
        conn: &Connection,
        user_id: &str,
        category: TxCategory,
        amount: i64,
        description: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO transactions (user_id, category, amount, time, description) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, category.as_str(), amount, Utc::now().timestamp(), description],
        )?;
        Ok(())
    }

    /// Fetch a user, auto-creating with `(0, 1, 0)` on first read. Never returns an error
    /// for "not found" — the contract is "never returns null".
    pub fn get_user(&self, user_id: &str) -> Result<User> {
        let inner = self.inner.lock().unwrap();
        Self::get_user_locked(&inner.data, user_id)
    }

    fn get_user_locked(conn: &Connection, user_id: &str) -> Result<User> {
        let found: Option<(i64, i64, i64)> = conn
            .query_row(
                "SELECT balance, last_daily_time, level FROM users WHERE user_id = ?1",
                params![user_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        match found {
            Some((balance, last_daily, level)) => Ok(User {
                user_id: user_id.to_string(),
                balance,
                level,
                last_daily,
            }),
            None => {
                conn.execute(
                    "INSERT INTO users (user_id, balance, last_daily_time, level) VALUES (?1, 0, 0, 1)",
                    params![user_id],
                )?;
                Ok(User {
                    user_id: user_id.to_string(),
                    balance: 0,
                    level: 1,
                    last_daily: 0,
                })
            }
        }
    }

    /// Credit `amount` and append an `income` transaction, atomically.
    pub fn add(&self, user_id: &str, amount: i64, description: &str) -> Result<()> {
        if amount < 0 {
            return Err(StarshardError::InvalidAmount(format!(
                "add amount must be >= 0, got {amount}"
            )));
        }
        let inner = self.inner.lock().unwrap();
        Self::get_user_locked(&inner.data, user_id)?;
        inner.data.execute(
            "UPDATE users SET balance = balance + ?1 WHERE user_id = ?2",
            params![amount, user_id],
        )?;
        Self::log_tx(&inner.transactions, user_id, TxCategory::Income, amount, description)
    }

    /// Debit `amount` and append an `expense` transaction. The ledger does not itself
    /// reject overdraft — callers must pre-check funds; going negative here is a caller
    /// contract violation, not a ledger-level error.
    pub fn cost(&self, user_id: &str, amount: i64, description: &str) -> Result<()> {
        if amount < 0 {
            return Err(StarshardError::InvalidAmount(format!(
                "cost amount must be >= 0, got {amount}"
            )));
        }
        let inner = self.inner.lock().unwrap();
        Self::get_user_locked(&inner.data, user_id)?;
        inner.data.execute(
            "UPDATE users SET balance = balance - ?1 WHERE user_id = ?2",
            params![amount, user_id],
        )?;
        Self::log_tx(&inner.transactions, user_id, TxCategory::Expense, -amount, description)
    }

    /// Overwrite the balance outright and append a `set` transaction recording the
    /// delta. Admin-only in practice; rejects a negative target balance.
    pub fn set(&self, user_id: &str, amount: i64, description: &str) -> Result<()> {
        if amount < 0 {
            return Err(StarshardError::OverdraftOnSet);
        }
        let inner = self.inner.lock().unwrap();
        let current = Self::get_user_locked(&inner.data, user_id)?;
        let delta = amount - current.balance;
        inner.data.execute(
            "UPDATE users SET balance = ?1 WHERE user_id = ?2",
            params![amount, user_id],
        )?;
        Self::log_tx(&inner.transactions, user_id, TxCategory::Set, delta, description)
    }

    /// `cost(from); add(to)` under one lock, plus a summary `transfer` transaction
    /// against the recipient. Either both sides commit or neither — the whole body runs
    /// while holding the single ledger lock, so no reader observes a half-applied state.
    pub fn transfer(&self, from: &str, to: &str, amount: i64, description: &str) -> Result<()> {
        if amount <= 0 {
            return Err(StarshardError::InvalidAmount(format!(
                "transfer amount must be > 0, got {amount}"
            )));
        }
        if from == to {
            return Err(StarshardError::InvalidArgument(
                "cannot transfer to self".to_string(),
            ));
        }
        let inner = self.inner.lock().unwrap();
        let sender = Self::get_user_locked(&inner.data, from)?;
        if sender.balance < amount {
            return Err(StarshardError::InsufficientBalance);
        }
        Self::get_user_locked(&inner.data, to)?;

        inner.data.execute(
            "UPDATE users SET balance = balance - ?1 WHERE user_id = ?2",
            params![amount, from],
        )?;
        inner.data.execute(
            "UPDATE users SET balance = balance + ?1 WHERE user_id = ?2",
            params![amount, to],
        )?;
        Self::log_tx(&inner.transactions, from, TxCategory::Expense, -amount, description)?;
        Self::log_tx(&inner.transactions, to, TxCategory::Income, amount, description)?;
        Self::log_tx(
            &inner.transactions,
            to,
            TxCategory::Transfer,
            amount,
            &format!("transfer from {from}: {description}"),
        )
    }

    /// True iff `last_daily`'s calendar day (local time) differs from today; on true,
    /// advances `last_daily` to now. Idempotent within one local day.
    pub fn daily(&self, user_id: &str) -> Result<bool> {
        let inner = self.inner.lock().unwrap();
        let user = Self::get_user_locked(&inner.data, user_id)?;
        let last = Local
            .timestamp_opt(user.last_daily, 0)
            .single()
            .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap());
        let now = Local::now();
        if user.last_daily != 0 && last.date_naive() == now.date_naive() {
            return Ok(false);
        }
        inner.data.execute(
            "UPDATE users SET last_daily_time = ?1 WHERE user_id = ?2",
            params![now.timestamp(), user_id],
        )?;
        Ok(true)
    }

    /// Clamped Gaussian daily bonus, `round(Gauss(mu=5.5, sigma=2))` clamped to `[1,10]`,
    /// via a hand-rolled Box-Muller transform (no `rand_distr` dependency needed for one
    /// call site).
    pub fn roll_daily_bonus<R: Rng>(rng: &mut R) -> i64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        let z0 = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        let sample = 5.5 + 2.0 * z0;
        sample.round().clamp(1.0, 10.0) as i64
    }

    pub fn get_level(&self, user_id: &str) -> Result<i64> {
        Ok(self.get_user(user_id)?.level)
    }

    pub fn set_level(&self, user_id: &str, level: i64) -> Result<()> {
        let level = level.max(1);
        let inner = self.inner.lock().unwrap();
        Self::get_user_locked(&inner.data, user_id)?;
        inner.data.execute(
            "UPDATE users SET level = ?1 WHERE user_id = ?2",
            params![level, user_id],
        )?;
        Ok(())
    }

    pub fn increase_level(&self, user_id: &str, n: i64) -> Result<i64> {
        let inner = self.inner.lock().unwrap();
        let user = Self::get_user_locked(&inner.data, user_id)?;
        let new_level = (user.level + n).max(1);
        inner.data.execute(
            "UPDATE users SET level = ?1 WHERE user_id = ?2",
            params![new_level, user_id],
        )?;
        Ok(new_level)
    }

    pub fn decrease_level(&self, user_id: &str, n: i64) -> Result<i64> {
        self.increase_level(user_id, -n)
    }

    /// The piecewise upgrade cost for moving from `level` to `level + 1` (§6).
    pub fn upgrade_cost(level: i64, tier1_cutoff: i64, tier2_cutoff: i64) -> i64 {
        if level <= tier1_cutoff {
            3 + level
        } else if level <= tier2_cutoff {
            (25.0 + (level - tier1_cutoff) as f64).powf(1.3).floor() as i64
        } else {
            (150.0 * 1.05f64.powi((level - tier2_cutoff) as i32)).floor() as i64
        }
    }

    pub fn get_top_users(&self, limit: i64) -> Result<Vec<User>> {
        let inner = self.inner.lock().unwrap();
        let mut stmt = inner.data.prepare(
            "SELECT user_id, balance, last_daily_time, level FROM users ORDER BY level DESC, balance DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok(User {
                user_id: row.get(0)?,
                balance: row.get(1)?,
                last_daily: row.get(2)?,
                level: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Rank counts how many users strictly outrank `(level, balance)`;
    /// `distance_to_next_rank` is the balance gap to the nearest strictly-higher user at
    /// the same level (else 0); `distance_to_next_level` is `next_level - current_level`
    /// across all users (else 0).
    pub fn get_user_rank(&self, user_id: &str) -> Result<RankInfo> {
        let inner = self.inner.lock().unwrap();
        let user = Self::get_user_locked(&inner.data, user_id)?;

        let rank: i64 = inner.data.query_row(
            "SELECT COUNT(*) FROM users WHERE level > ?1 OR (level = ?1 AND balance > ?2)",
            params![user.level, user.balance],
            |row| row.get(0),
        )?;

        let distance_to_next_rank: i64 = inner
            .data
            .query_row(
                "SELECT MIN(balance) FROM users WHERE level = ?1 AND balance > ?2",
                params![user.level, user.balance],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .map(|next_balance| next_balance - user.balance)
            .unwrap_or(0);

        let distance_to_next_level: i64 = inner
            .data
            .query_row(
                "SELECT MIN(level) FROM users WHERE level > ?1",
                params![user.level],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .map(|next_level| next_level - user.level)
            .unwrap_or(0);

        Ok(RankInfo {
            rank: rank + 1,
            distance_to_next_rank,
            distance_to_next_level,
        })
    }

    pub fn get_user_transactions(
        &self,
        user_id: &str,
        description_filter: Option<&str>,
        limit: Option<i64>,
    ) -> Result<Vec<Transaction>> {
        let inner = self.inner.lock().unwrap();
        let limit = limit.unwrap_or(100);
        let rows: Vec<Transaction> = match description_filter {
            Some(filter) => {
                let mut stmt = inner.transactions.prepare(
                    "SELECT id, user_id, category, amount, time, description FROM transactions
                     WHERE user_id = ?1 AND description LIKE ?2 ORDER BY id DESC LIMIT ?3",
                )?;
                let like = format!("%{filter}%");
                let mapped = stmt.query_map(params![user_id, like, limit], Self::map_tx_row)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
            None => {
                let mut stmt = inner.transactions.prepare(
                    "SELECT id, user_id, category, amount, time, description FROM transactions
                     WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                let mapped = stmt.query_map(params![user_id, limit], Self::map_tx_row)?;
                mapped.collect::<rusqlite::Result<Vec<_>>>()?
            }
        };
        Ok(rows)
    }

    fn map_tx_row(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
        let category: String = row.get(2)?;
        Ok(Transaction {
            id: row.get(0)?,
            user_id: row.get(1)?,
            category: TxCategory::from_str(&category),
            amount: row.get(3)?,
            time: row.get(4)?,
            description: row.get(5)?,
        })
    }

    /// First `setnick` is free; subsequent sets cost `reset_cost` shards and must be
    /// unique.
    pub fn set_nickname(&self, user_id: &str, nickname: &str, reset_cost: i64) -> Result<()> {
        if nickname.len() > 20 || nickname.contains('\n') {
            return Err(StarshardError::NicknameTooLong);
        }
        let inner = self.inner.lock().unwrap();
        let existing_owner: Option<String> = inner
            .data
            .query_row(
                "SELECT user_id FROM nicknames WHERE nickname = ?1",
                params![nickname],
                |row| row.get(0),
            )
            .optional()?;
        if existing_owner.map(|owner| owner != user_id).unwrap_or(false) {
            return Err(StarshardError::DuplicateNickname);
        }

        let set_count: i64 = inner
            .data
            .query_row(
                "SELECT set_count FROM nicknames WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if set_count > 0 {
            let user = Self::get_user_locked(&inner.data, user_id)?;
            if user.balance < reset_cost {
                return Err(StarshardError::InsufficientBalance);
            }
            inner.data.execute(
                "UPDATE users SET balance = balance - ?1 WHERE user_id = ?2",
                params![reset_cost, user_id],
            )?;
            Self::log_tx(
                &inner.transactions,
                user_id,
                TxCategory::Expense,
                -reset_cost,
                "setnick",
            )?;
        }

        inner.data.execute(
            "INSERT INTO nicknames (user_id, nickname, set_count) VALUES (?1, ?2, 1)
             ON CONFLICT(user_id) DO UPDATE SET nickname = excluded.nickname, set_count = set_count + 1",
            params![user_id, nickname],
        )?;
        Ok(())
    }

    pub fn get_nickname(&self, user_id: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        let nickname = inner
            .data
            .query_row(
                "SELECT nickname FROM nicknames WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(nickname)
    }

    /// Resolve a nickname back to a user id, used by `transfer <nick> <amount>`.
    pub fn find_by_nickname(&self, nickname: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        let user_id = inner
            .data
            .query_row(
                "SELECT user_id FROM nicknames WHERE nickname = ?1",
                params![nickname],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }
}

fn migrate_add_level_column(conn: &Connection) -> Result<()> {
    let mut has_level = false;
    {
        let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            if name == "level" {
                has_level = true;
            }
        }
    }
    if !has_level {
        conn.execute("ALTER TABLE users ADD COLUMN level INTEGER NOT NULL DEFAULT 1", [])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn test_ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path()).unwrap();
        (dir, ledger)
    }

    #[test]
    fn new_user_has_defaults() {
        let (_dir, ledger) = test_ledger();
        let user = ledger.get_user("u1").unwrap();
        assert_eq!(user.balance, 0);
        assert_eq!(user.level, 1);
        assert_eq!(user.last_daily, 0);
    }

    #[test]
    fn add_and_cost_update_balance_and_log_transactions() {
        let (_dir, ledger) = test_ledger();
        ledger.add("u1", 100, "grant").unwrap();
        ledger.cost("u1", 40, "spend").unwrap();
        assert_eq!(ledger.get_user("u1").unwrap().balance, 60);
        let txs = ledger.get_user_transactions("u1", None, None).unwrap();
        assert_eq!(txs.len(), 2);
    }

    #[test]
    fn balance_equals_sum_of_signed_transactions() {
        let (_dir, ledger) = test_ledger();
        ledger.add("u1", 100, "grant").unwrap();
        ledger.cost("u1", 40, "spend").unwrap();
        ledger.set("u1", 10, "admin reset").unwrap();
        let txs = ledger.get_user_transactions("u1", None, None).unwrap();
        let signed: i64 = txs.iter().map(|t| t.amount).sum();
        assert_eq!(signed, ledger.get_user("u1").unwrap().balance);
    }

    #[test]
    fn transfer_moves_balance_atomically() {
        let (_dir, ledger) = test_ledger();
        ledger.add("a", 50, "seed").unwrap();
        ledger.transfer("a", "b", 20, "gift").unwrap();
        assert_eq!(ledger.get_user("a").unwrap().balance, 30);
        assert_eq!(ledger.get_user("b").unwrap().balance, 20);
    }

    #[test]
    fn transfer_rejects_insufficient_balance() {
        let (_dir, ledger) = test_ledger();
        let err = ledger.transfer("a", "b", 20, "gift").unwrap_err();
        assert_eq!(err.kind(), "insufficient_balance");
    }

    #[test]
    fn transfer_rejects_self() {
        let (_dir, ledger) = test_ledger();
        ledger.add("a", 50, "seed").unwrap();
        let err = ledger.transfer("a", "a", 10, "gift").unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");
    }

    #[test]
    fn daily_is_idempotent_within_a_local_day() {
        let (_dir, ledger) = test_ledger();
        assert!(ledger.daily("u1").unwrap());
        assert!(!ledger.daily("u1").unwrap());
    }

    #[test]
    fn daily_bonus_is_clamped_to_one_through_ten() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        for _ in 0..1000 {
            let bonus = Ledger::roll_daily_bonus(&mut rng);
            assert!((1..=10).contains(&bonus));
        }
    }

    #[test]
    fn rank_orders_by_level_then_balance() {
        let (_dir, ledger) = test_ledger();
        ledger.add("low", 10, "seed").unwrap();
        ledger.add("high", 1000, "seed").unwrap();
        ledger.increase_level("high", 5).unwrap();
        let rank = ledger.get_user_rank("low").unwrap();
        assert_eq!(rank.rank, 2);
    }

    #[test]
    fn level_never_drops_below_one() {
        let (_dir, ledger) = test_ledger();
        let level = ledger.decrease_level("u1", 10).unwrap();
        assert_eq!(level, 1);
    }

    #[test]
    fn upgrade_cost_matches_piecewise_formula() {
        assert_eq!(Ledger::upgrade_cost(1, 20, 60), 4);
        assert_eq!(Ledger::upgrade_cost(20, 20, 60), 23);
        assert!(Ledger::upgrade_cost(61, 20, 60) >= 150);
    }

    #[test]
    fn first_setnick_is_free_second_costs_reset_fee() {
        let (_dir, ledger) = test_ledger();
        ledger.add("u1", 100, "seed").unwrap();
        ledger.set_nickname("u1", "Alice", 30).unwrap();
        assert_eq!(ledger.get_user("u1").unwrap().balance, 100);
        ledger.set_nickname("u1", "Alicia", 30).unwrap();
        assert_eq!(ledger.get_user("u1").unwrap().balance, 70);
    }

    #[test]
    fn duplicate_nickname_is_rejected() {
        let (_dir, ledger) = test_ledger();
        ledger.set_nickname("u1", "Alice", 30).unwrap();
        let err = ledger.set_nickname("u2", "Alice", 30).unwrap_err();
        assert_eq!(err.kind(), "duplicate_nickname");
    }
}
