//! Passive-reply correlation buffer (C2).
//!
//! For outbound messages directed at a channel, lends a reference to a recent inbound
//! message so the transport can correlate a reply; eligibility is bounded by a TTL and a
//! reuse count. Purely in-memory, one lock, a periodic sweep — the simplest possible
//! instance of the teacher's scheduler shape in `src/bbs/dispatch.rs` (single-lock queue
//! plus a `tokio::spawn` + `select!` sleep loop), stripped of priority and pacing since
//! this component needs neither.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;

const TTL_SECONDS: i64 = 5 * 60;
const MAX_REUSE: i64 = 5;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct PassiveRecord {
    message_id: String,
    timestamp: i64,
    reuse_count: i64,
}

/// A `(message_id, seq)` tag handed to the transport for one outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassiveRef {
    pub message_id: String,
    pub seq: i64,
}

#[derive(Default)]
struct State {
    by_channel: HashMap<String, VecDeque<PassiveRecord>>,
}

/// Cheap-clone handle over the shared passive pool.
#[derive(Clone)]
pub struct Correlator {
    state: Arc<Mutex<State>>,
}

impl Correlator {
    pub fn new() -> Self {
        Correlator {
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Register one inbound message as a future passive-reply candidate.
    pub async fn register(&self, channel_id: &str, message_id: &str) {
        let mut state = self.state.lock().await;
        let bucket = state.by_channel.entry(channel_id.to_string()).or_default();
        bucket.push_back(PassiveRecord {
            message_id: message_id.to_string(),
            timestamp: Utc::now().timestamp(),
            reuse_count: 0,
        });
    }

    /// Reserve a reference for one outbound reply on `channel_id`: the most recent
    /// eligible inbound record (`age <= 5min`, `reuse_count <= 5`), incrementing its
    /// `seq` atomically. Returns `None` if nothing is eligible.
    pub async fn reserve(&self, channel_id: &str) -> Option<PassiveRef> {
        let mut state = self.state.lock().await;
        let bucket = state.by_channel.get_mut(channel_id)?;
        let now = Utc::now().timestamp();
        let candidate = bucket
            .iter_mut()
            .rev()
            .find(|record| now - record.timestamp <= TTL_SECONDS && record.reuse_count <= MAX_REUSE)?;
        candidate.reuse_count += 1;
        Some(PassiveRef {
            message_id: candidate.message_id.clone(),
            seq: candidate.reuse_count,
        })
    }

    /// Drop every record past its TTL. Run from the sweep task, but also callable
    /// directly for tests.
    pub async fn sweep(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now().timestamp();
        state.by_channel.retain(|_, bucket| {
            bucket.retain(|record| now - record.timestamp <= TTL_SECONDS);
            !bucket.is_empty()
        });
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the background sweep task; matches the teacher's `start_scheduler` shape of a
/// detached `tokio::spawn` loop ticking on a fixed interval.
pub fn spawn_sweeper(correlator: Correlator) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            correlator.sweep().await;
            log::debug!("passive correlator sweep complete");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_returns_none_with_no_inbound() {
        let correlator = Correlator::new();
        assert!(correlator.reserve("c1").await.is_none());
    }

    #[tokio::test]
    async fn reserve_returns_most_recent_eligible_record() {
        let correlator = Correlator::new();
        correlator.register("c1", "m1").await;
        correlator.register("c1", "m2").await;
        let reference = correlator.reserve("c1").await.unwrap();
        assert_eq!(reference.message_id, "m2");
        assert_eq!(reference.seq, 1);
    }

    #[tokio::test]
    async fn reuse_count_increments_on_each_reservation() {
        let correlator = Correlator::new();
        correlator.register("c1", "m1").await;
        let first = correlator.reserve("c1").await.unwrap();
        let second = correlator.reserve("c1").await.unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
    }

    #[tokio::test]
    async fn record_becomes_ineligible_after_max_reuse() {
        let correlator = Correlator::new();
        correlator.register("c1", "m1").await;
        for _ in 0..MAX_REUSE {
            assert!(correlator.reserve("c1").await.is_some());
        }
        assert!(correlator.reserve("c1").await.is_none());
    }

    #[tokio::test]
    async fn sweep_drops_expired_records() {
        let correlator = Correlator::new();
        {
            let mut state = correlator.state.lock().await;
            let bucket = state.by_channel.entry("c1".to_string()).or_default();
            bucket.push_back(PassiveRecord {
                message_id: "old".to_string(),
                timestamp: Utc::now().timestamp() - TTL_SECONDS - 1,
                reuse_count: 0,
            });
        }
        correlator.sweep().await;
        assert!(correlator.reserve("c1").await.is_none());
    }
}
