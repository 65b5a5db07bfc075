//! Session Registry (C3): enforces "at most one active game per user" per game, holds
//! per-session mutable state, and routes subsequent inbound messages from the owning
//! user into the owning session.
//!
//! Grounded on `src/bbs/game_registry.rs` (one registry struct per game/door) and
//! `src/bbs/session.rs` (a session struct carrying per-connection mutable state), but
//! generalized: a spec.md §9 redesign note calls for "each game's registry as a
//! long-lived service object ... with a single lock guarding its maps", so this is one
//! generic `SessionRegistry<S>` parameterized over the game-specific session payload `S`,
//! instantiated once per game rather than copy-pasted per game.

pub mod turn_engine;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::error::{Result, StarshardError};
pub use turn_engine::{InboundMessage, OutboundMessage, TurnHandle};

const INBOX_CAPACITY: usize = 16;

struct State<S> {
    active_players: HashSet<String>,
    sessions: HashMap<String, Arc<Mutex<S>>>,
    inboxes: HashMap<String, mpsc::Sender<InboundMessage>>,
}

impl<S> Default for State<S> {
    fn default() -> Self {
        State {
            active_players: HashSet::new(),
            sessions: HashMap::new(),
            inboxes: HashMap::new(),
        }
    }
}

/// Per-game registry of active sessions, generic over the session payload type `S`.
#[derive(Clone)]
pub struct SessionRegistry<S> {
    state: Arc<Mutex<State<S>>>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl<S: Send + 'static> SessionRegistry<S> {
    pub fn new(outbound: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        SessionRegistry {
            state: Arc::new(Mutex::new(State::default())),
            outbound,
        }
    }

    pub async fn is_in_game(&self, user_id: &str) -> bool {
        self.state.lock().await.active_players.contains(user_id)
    }

    /// Start a session for `user_id`. The caller must have already debited any stake
    /// before calling this (or refund it if this returns `AlreadyInGame`), per the start
    /// rule in §4.3: "On accept, call ledger.cost(user, bet), insert session, mark
    /// active."
    pub async fn start_session(
        &self,
        user_id: &str,
        channel_id: &str,
        payload: S,
    ) -> Result<(Arc<Mutex<S>>, TurnHandle)> {
        let mut state = self.state.lock().await;
        if state.active_players.contains(user_id) {
            return Err(StarshardError::AlreadyInGame);
        }
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        state.active_players.insert(user_id.to_string());
        let session = Arc::new(Mutex::new(payload));
        state.sessions.insert(user_id.to_string(), session.clone());
        state.inboxes.insert(user_id.to_string(), tx);
        let handle = TurnHandle::new(user_id.to_string(), channel_id.to_string(), rx, self.outbound.clone());
        Ok((session, handle))
    }

    /// Tear down a session on settlement, refund, or cancellation.
    pub async fn end_session(&self, user_id: &str) {
        let mut state = self.state.lock().await;
        state.active_players.remove(user_id);
        state.sessions.remove(user_id);
        state.inboxes.remove(user_id);
    }

    /// Route an inbound message from `user_id` into their owning session's inbox, if any.
    /// Returns `true` if a session owned this message.
    pub async fn route_message(&self, user_id: &str, message: InboundMessage) -> bool {
        let state = self.state.lock().await;
        if let Some(tx) = state.inboxes.get(user_id) {
            tx.send(message).await.is_ok()
        } else {
            false
        }
    }

    pub async fn get_session(&self, user_id: &str) -> Option<Arc<Mutex<S>>> {
        self.state.lock().await.sessions.get(user_id).cloned()
    }

    /// All currently active user ids, for shutdown-time refund iteration (§5: "On process
    /// shutdown, every registry iterates its active set and refunds").
    pub async fn active_user_ids(&self) -> Vec<String> {
        self.state.lock().await.active_players.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_session_enforces_one_active_game_per_user() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry: SessionRegistry<i32> = SessionRegistry::new(tx);
        let (_session, _handle) = registry.start_session("u1", "c1", 0).await.unwrap();
        assert!(registry.is_in_game("u1").await);
        let err = registry.start_session("u1", "c1", 0).await.unwrap_err();
        assert_eq!(err.kind(), "already_in_game");
    }

    #[tokio::test]
    async fn end_session_frees_the_user_to_start_again() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry: SessionRegistry<i32> = SessionRegistry::new(tx);
        registry.start_session("u1", "c1", 0).await.unwrap();
        registry.end_session("u1").await;
        assert!(!registry.is_in_game("u1").await);
        assert!(registry.start_session("u1", "c1", 0).await.is_ok());
    }

    #[tokio::test]
    async fn route_message_delivers_only_to_owning_session() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry: SessionRegistry<i32> = SessionRegistry::new(tx);
        let (_session, mut handle) = registry.start_session("u1", "c1", 0).await.unwrap();

        assert!(!registry.route_message("u2", InboundMessage::new("c1", "u2", "m1", "hi")).await);

        let delivered = registry
            .route_message("u1", InboundMessage::new("c1", "u1", "m2", "hit"))
            .await;
        assert!(delivered);
        let received = handle.wait(std::time::Duration::from_millis(50)).await.unwrap();
        assert_eq!(received.text, "hit");
    }

    #[tokio::test]
    async fn active_user_ids_reflects_current_sessions() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry: SessionRegistry<i32> = SessionRegistry::new(tx);
        registry.start_session("u1", "c1", 0).await.unwrap();
        registry.start_session("u2", "c1", 0).await.unwrap();
        let mut ids = registry.active_user_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["u1".to_string(), "u2".to_string()]);
    }
}
