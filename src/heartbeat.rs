//! Periodic heartbeat scheduling, ack tracking, and zombie-connection
//! detection.

use crate::{command::Command, outbound::OutboundSink};
use std::{
    slice::Iter,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as MutexSync,
    },
    time::Duration,
};
use tokio::{sync::Notify, time::Instant};

/// Why the heartbeat loop gave up on the connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HeartbeatFailure {
    /// No ACK was observed since the last heartbeat was sent, by the time
    /// the next one was due. The connection is presumed zombied.
    Zombied,
}

/// Rolling statistics about heartbeat round-trip time.
///
/// Tracks the 5 most recent latencies and a running average, the same
/// window size and arithmetic the reference gateway client keeps for
/// debugging slow connections.
#[derive(Clone, Debug)]
pub struct Latency {
    heartbeats: u32,
    received: Option<Instant>,
    recent: [Duration; Self::RECENT_LEN],
    sent: Option<Instant>,
    total_millis: u64,
}

impl Latency {
    const RECENT_LEN: usize = 5;

    const fn new() -> Self {
        Self {
            heartbeats: 0,
            received: None,
            recent: [Duration::ZERO; Self::RECENT_LEN],
            sent: None,
            total_millis: 0,
        }
    }

    /// Average round-trip time across the life of the session, or `None` if
    /// no ACK has been received yet.
    pub const fn average(&self) -> Option<Duration> {
        Duration::from_millis(self.total_millis).checked_div(self.heartbeats)
    }

    /// Total number of acknowledged heartbeats this session.
    pub const fn heartbeats(&self) -> u32 {
        self.heartbeats
    }

    /// The up-to-5 most recent round-trip times, oldest first.
    pub fn recent(&self) -> Iter<'_, Duration> {
        self.recent.iter()
    }

    fn track_sent(&mut self) {
        self.received = None;
        self.sent = Some(Instant::now());
    }

    fn track_received(&mut self) -> Option<Duration> {
        self.received = Some(Instant::now());
        self.heartbeats += 1;

        let duration = self.sent?.elapsed();
        let millis: u64 = duration.as_millis().try_into().unwrap_or(u64::MAX);

        self.total_millis = self.total_millis.saturating_add(millis);
        self.recent.rotate_right(1);
        self.recent[0] = duration;

        Some(duration)
    }
}

impl Default for Latency {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodic heartbeat scheduler for one connection attempt.
///
/// At most one instance runs per connection, per the invariant in spec.md
/// §3; `ControlFsm` spawns a fresh controller for every attempt and drops
/// the old one on reconnect.
#[derive(Debug)]
pub struct HeartbeatController {
    last_sent: Arc<AtomicU64>,
    last_ack: Arc<AtomicU64>,
    latency: Arc<MutexSync<Latency>>,
    zombied: Arc<AtomicBool>,
    zombie_notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<HeartbeatFailure>,
}

/// Epoch used for the "no heartbeat yet" / zombied-from-birth sentinel:
/// `last_ack` starts at this value, which compares less than any real
/// monotonic tick count, so a server that never acks looks overdue
/// immediately rather than looking fresh.
const NEVER: u64 = 0;

impl HeartbeatController {
    /// Start a new heartbeat loop.
    ///
    /// `interval` is the *scaled* period to sleep between beats (already
    /// multiplied by 0.75, per spec.md §4.3); `seq` is shared with
    /// `SessionState` so each beat carries the latest sequence number;
    /// `sink` is the path every heartbeat takes to reach the socket, gated
    /// by the same rate limiter as caller-initiated commands.
    pub fn start(
        interval: Duration,
        seq: impl Fn() -> Option<u64> + Send + Sync + 'static,
        sink: OutboundSink,
    ) -> Self {
        let last_sent = Arc::new(AtomicU64::new(NEVER));
        let last_ack = Arc::new(AtomicU64::new(NEVER));
        let latency = Arc::new(MutexSync::new(Latency::new()));
        let zombied = Arc::new(AtomicBool::new(false));
        let zombie_notify = Arc::new(Notify::new());

        let handle = tokio::spawn(Self::run(
            interval,
            seq,
            sink,
            Arc::clone(&last_sent),
            Arc::clone(&last_ack),
            Arc::clone(&latency),
            Arc::clone(&zombied),
            Arc::clone(&zombie_notify),
        ));

        Self {
            last_sent,
            last_ack,
            latency,
            zombied,
            zombie_notify,
            handle,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        interval: Duration,
        seq: impl Fn() -> Option<u64> + Send + Sync + 'static,
        sink: OutboundSink,
        last_sent: Arc<AtomicU64>,
        last_ack: Arc<AtomicU64>,
        latency: Arc<MutexSync<Latency>>,
        zombied: Arc<AtomicBool>,
        zombie_notify: Arc<Notify>,
    ) -> HeartbeatFailure {
        let mut tick: u64 = 1;

        loop {
            let tick_start = Instant::now();

            // Tick 1 always beats immediately: a brand new connection has no
            // ack yet to compare against, so there is nothing to detect a
            // zombie against on the very first iteration.
            if tick > 1 && last_ack.load(Ordering::Acquire) < last_sent.load(Ordering::Acquire) {
                zombied.store(true, Ordering::Release);
                zombie_notify.notify_waiters();
                return HeartbeatFailure::Zombied;
            }

            let command = Command::Heartbeat { seq: seq() };

            if sink.send(command).await.is_err() {
                // The writer task hung up; nothing left to heartbeat.
                std::future::pending::<()>().await;
            }

            last_sent.store(tick, Ordering::Release);
            latency.lock().expect("latency lock poisoned").track_sent();

            tokio::time::sleep(interval).await;
            tick += 1;

            let elapsed = tick_start.elapsed();
            if elapsed > interval + Duration::from_millis(50) {
                tracing::warn!(
                    ?elapsed,
                    ?interval,
                    "heartbeat loop ran late; the event loop may be starved"
                );
            }
        }
    }

    /// Record that an ACK (opcode 11) was received, updating latency
    /// statistics against the most recent send.
    pub fn handle_ack(&self) {
        let sent_tick = self.last_sent.load(Ordering::Acquire);
        self.last_ack.store(sent_tick.max(1), Ordering::Release);
        self.latency
            .lock()
            .expect("latency lock poisoned")
            .track_received();
    }

    /// A snapshot of the current rolling latency statistics.
    pub fn latency(&self) -> Latency {
        self.latency.lock().expect("latency lock poisoned").clone()
    }

    /// Whether the loop has already detected a zombied connection.
    pub fn is_zombied(&self) -> bool {
        self.zombied.load(Ordering::Acquire)
    }

    /// Suspend until the loop detects a zombied connection. Used by
    /// `ControlFsm` as one arm of its event-loop `select!`.
    pub async fn wait_zombied(&self) {
        loop {
            if self.is_zombied() {
                return;
            }

            let notified = self.zombie_notify.notified();
            if self.is_zombied() {
                return;
            }
            notified.await;
        }
    }

    /// Stop the heartbeat loop, discarding its result. Safe to call more
    /// than once; cancel-safe since the loop holds no locks across its
    /// sleep point.
    pub fn stop(&self) {
        self.handle.abort();
    }

    /// Wait for the heartbeat loop to report a failure (currently only
    /// zombie detection). Resolves to `None` if the loop was stopped first.
    pub async fn failed(self) -> Option<HeartbeatFailure> {
        self.handle.await.ok()
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Scale a server-supplied heartbeat interval down per spec.md §4.3, so the
/// client beats somewhat faster than the server expects and tolerates
/// network jitter without appearing to zombie.
pub fn scaled_interval(heartbeat_interval: Duration) -> Duration {
    heartbeat_interval.mul_f64(0.75)
}

#[cfg(test)]
mod tests {
    use super::{scaled_interval, HeartbeatController, HeartbeatFailure, Latency};
    use crate::{outbound::OutboundSink, ratelimit::RateLimiter};
    use static_assertions::assert_impl_all;
    use std::{fmt::Debug, sync::Arc, time::Duration};
    use tokio::sync::mpsc;

    assert_impl_all!(Latency: Clone, Debug, Send, Sync);
    assert_impl_all!(HeartbeatController: Debug, Send, Sync);

    fn test_sink() -> (OutboundSink, mpsc::UnboundedReceiver<crate::command::Command>) {
        let rate_limiter = Arc::new(RateLimiter::new(1000, Duration::from_secs(60)));
        let (tx, rx) = mpsc::unbounded_channel();
        (OutboundSink::new(rate_limiter, tx), rx)
    }

    #[test]
    fn scaling_is_three_quarters() {
        assert_eq!(
            scaled_interval(Duration::from_millis(12345)),
            Duration::from_micros(9_258_750)
        );
    }

    #[test]
    fn latency_average_and_recent_track_acks() {
        let mut latency = Latency::new();
        assert!(latency.average().is_none());

        latency.track_sent();
        let observed = latency.track_received();
        assert!(observed.is_some());
        assert_eq!(latency.heartbeats(), 1);
        assert!(latency.average().is_some());
        assert_eq!(latency.recent().count(), Latency::RECENT_LEN);
    }

    #[tokio::test(start_paused = true)]
    async fn zombied_connection_is_detected_when_no_ack_arrives() {
        let (sink, mut rx) = test_sink();
        let controller = HeartbeatController::start(Duration::from_millis(10), || None, sink);

        // drain the first immediate heartbeat
        let _ = rx.recv().await;

        // never send an ack; after the loop ticks again it must detect a
        // zombie and terminate its task with that failure.
        let failure = controller.failed().await;
        assert_eq!(failure, Some(HeartbeatFailure::Zombied));
    }

    #[tokio::test(start_paused = true)]
    async fn acking_promptly_prevents_zombie_detection() {
        let (sink, mut rx) = test_sink();
        let controller = HeartbeatController::start(Duration::from_millis(10), || Some(7), sink);

        let _ = rx.recv().await;
        controller.handle_ack();

        tokio::time::sleep(Duration::from_millis(15)).await;
        let _ = rx.recv().await;
        controller.handle_ack();

        controller.stop();
        assert!(controller.failed().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_zombied_resolves_once_detected() {
        let (sink, mut rx) = test_sink();
        let controller = Arc::new(HeartbeatController::start(
            Duration::from_millis(10),
            || None,
            sink,
        ));

        let _ = rx.recv().await;

        let waiter = Arc::clone(&controller);
        let waiter = tokio::spawn(async move { waiter.wait_zombied().await });

        tokio::time::sleep(Duration::from_millis(11)).await;
        waiter.await.unwrap();
        assert!(controller.is_zombied());
    }
}
