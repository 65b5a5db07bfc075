//! Turn Engine (C4): the primitive "await next message from this user/channel with
//! timeout", plus the `ask` convenience wrapper that emits a prompt first.
//!
//! Grounded on `src/bbs/dispatch.rs::start_scheduler`'s `tokio::select! { Some(cmd) =
//! rx.recv() => ..., _ = tokio::time::sleep(TICK) => {} }` shape, simplified to the one
//! thing this primitive needs: race a channel receive against a timeout. Suspension only
//! happens inside `wait`, per §5's concurrency contract — `TurnHandle::wait` is the only
//! `.await` point a game's state machine needs between turns.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::{Result, StarshardError};

/// One inbound chat event routed to an owning session.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel_id: String,
    pub user_id: String,
    pub message_id: String,
    pub text: String,
}

impl InboundMessage {
    pub fn new(channel_id: &str, user_id: &str, message_id: &str, text: &str) -> Self {
        InboundMessage {
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            message_id: message_id.to_string(),
            text: text.to_string(),
        }
    }
}

/// One outbound reply a session wants delivered to its channel.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel_id: String,
    pub content: String,
}

/// Bound to one session's inbox; the only type a game's state machine needs to drive a
/// multi-turn dialog.
pub struct TurnHandle {
    #[allow(dead_code)]
    user_id: String,
    channel_id: String,
    inbox: mpsc::Receiver<InboundMessage>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl TurnHandle {
    pub(crate) fn new(
        user_id: String,
        channel_id: String,
        inbox: mpsc::Receiver<InboundMessage>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
    ) -> Self {
        TurnHandle {
            user_id,
            channel_id,
            inbox,
            outbound,
        }
    }

    /// Send a message to this session's channel without waiting for a reply.
    pub fn emit(&self, content: impl Into<String>) {
        let _ = self.outbound.send(OutboundMessage {
            channel_id: self.channel_id.clone(),
            content: content.into(),
        });
    }

    /// Await the next message from this session's owning user, or `Timeout` if none
    /// arrives within `timeout`. The suspension point named in §5's concurrency model.
    pub async fn wait(&mut self, timeout: Duration) -> Result<InboundMessage> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(StarshardError::Internal("session inbox closed".to_string())),
            Err(_) => Err(StarshardError::Timeout),
        }
    }

    /// Emit `prompt`, then wait for the next message, within `timeout`.
    pub async fn ask(&mut self, prompt: impl Into<String>, timeout: Duration) -> Result<InboundMessage> {
        self.emit(prompt);
        self.wait(timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_pair() -> (mpsc::Sender<InboundMessage>, TurnHandle, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let handle = TurnHandle::new("u1".to_string(), "c1".to_string(), rx, out_tx);
        (tx, handle, out_rx)
    }

    #[tokio::test]
    async fn wait_returns_the_next_queued_message() {
        let (tx, mut handle, _out_rx) = handle_pair();
        tx.send(InboundMessage::new("c1", "u1", "m1", "hit")).await.unwrap();
        let message = handle.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(message.text, "hit");
    }

    #[tokio::test]
    async fn wait_times_out_when_nothing_arrives() {
        let (_tx, mut handle, _out_rx) = handle_pair();
        let err = handle.wait(Duration::from_millis(10)).await.unwrap_err();
        assert_eq!(err.kind(), "timeout");
    }

    #[tokio::test]
    async fn ask_emits_prompt_before_waiting() {
        let (tx, mut handle, mut out_rx) = handle_pair();
        tx.send(InboundMessage::new("c1", "u1", "m1", "5")).await.unwrap();
        let message = handle.ask("pick a number", Duration::from_millis(100)).await.unwrap();
        assert_eq!(message.text, "5");
        let prompt = out_rx.try_recv().unwrap();
        assert_eq!(prompt.content, "pick a number");
    }
}
