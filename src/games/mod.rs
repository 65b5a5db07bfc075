//! The three stake-based mini-game cores (C5–C7): Blackjack, Mines, and One-Stroke.
//!
//! Each core owns a [`SessionRegistry`](crate::session::SessionRegistry) instantiated
//! over its own session-payload type, a small SQLite-backed result store, and drives its
//! state machine through a [`TurnHandle`](crate::session::TurnHandle). Grounded on
//! `original_source/plugins/blackjack`, `plugins/mines`, `plugins/one_stroke` for exact
//! state-machine shape, re-expressed without exception-for-control-flow per spec.md §9.

pub mod blackjack;
pub mod mines;
pub mod onestroke;

use std::path::Path;

use rusqlite::Connection;
use std::sync::{Arc, Mutex};

use crate::error::Result;

/// A tiny wrapper shared by each game's result store: one SQLite connection behind a
/// mutex, the same cheap-clone "store handle" shape as the ledger.
#[derive(Clone)]
pub struct GameStore {
    conn: Arc<Mutex<Connection>>,
}

impl GameStore {
    pub fn open(data_dir: &Path, subsystem: &str, create_table_sql: &str) -> Result<Self> {
        let dir = data_dir.join(subsystem);
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("games.db"))?;
        conn.execute_batch(create_table_sql)?;
        Ok(GameStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        Ok(f(&conn)?)
    }
}
