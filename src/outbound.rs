//! The single path every outbound command takes.
//!
//! [`OutboundSink::send`] first acquires a [`RateLimiter`] token — suspending
//! the caller if the bucket is saturated — then hands the command to the
//! per-connection writer task that owns the socket. Cloning an
//! [`OutboundSink`] is cheap; one clone lives in [`GatewayEngine`](crate::engine::GatewayEngine)
//! for `send_command`, one in each [`HeartbeatController`](crate::heartbeat::HeartbeatController),
//! and one in `ControlFsm` for HEARTBEAT_ACK replies, so every outbound
//! write is gated by the same limiter and funneled through the same writer,
//! satisfying spec.md §5's no-concurrent-writes policy without a lock
//! around the socket itself.

use crate::{
    command::Command,
    error::{SendError, SendErrorType},
    ratelimit::RateLimiter,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

#[derive(Clone, Debug)]
pub struct OutboundSink {
    rate_limiter: Arc<RateLimiter>,
    tx: UnboundedSender<Command>,
}

impl OutboundSink {
    pub(crate) fn new(rate_limiter: Arc<RateLimiter>, tx: UnboundedSender<Command>) -> Self {
        Self { rate_limiter, tx }
    }

    /// Acquire a token, then enqueue `command` for the writer task.
    ///
    /// # Errors
    ///
    /// Returns [`SendErrorType::SessionInactive`] if the writer task for the
    /// current connection attempt has already shut down.
    pub async fn send(&self, command: Command) -> Result<(), SendError> {
        self.rate_limiter.acquire().await;

        self.tx.send(command).map_err(|_| SendError {
            kind: SendErrorType::SessionInactive,
            source: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::OutboundSink;
    use crate::{command::Command, ratelimit::RateLimiter};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    assert_impl_all!(OutboundSink: Clone, Debug, Send, Sync);

    #[tokio::test]
    async fn send_enqueues_for_the_writer() {
        let rate_limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = OutboundSink::new(rate_limiter, tx);

        sink.send(Command::Heartbeat { seq: Some(1) }).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(Command::Heartbeat { seq: Some(1) })
        ));
    }

    #[tokio::test]
    async fn send_after_writer_drop_is_session_inactive() {
        let rate_limiter = Arc::new(RateLimiter::new(5, Duration::from_secs(60)));
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = OutboundSink::new(rate_limiter, tx);

        let err = sink.send(Command::Heartbeat { seq: None }).await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::error::SendErrorType::SessionInactive
        ));
    }
}
