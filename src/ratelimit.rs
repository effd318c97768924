//! Outbound command rate limiting.
//!
//! The platform documents a hard limit of 120 commands per rolling 60
//! second window and forcibly closes (non-resumably) any connection that
//! exceeds it — considerably more expensive than waiting locally, so every
//! outbound command is gated through this module before it reaches the
//! socket.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::{Notify, Semaphore};
use tokio::time::{self, Duration};

/// Default number of commands allotted per window, per the platform's
/// documented gateway rate limit.
pub const DEFAULT_CAPACITY: u32 = 120;
/// Default rolling window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// A FIFO-fair token bucket gating outbound gateway commands.
///
/// Waiters are served in the order they called [`acquire`](Self::acquire),
/// which [`tokio::sync::Semaphore`] guarantees. Dropping an in-flight
/// `acquire` future (e.g. via [`tokio::select!`] or task cancellation) never
/// consumes a token: `Semaphore::acquire` only hands out a permit once the
/// future actually resolves, so a cancelled wait leaves the bucket
/// untouched.
#[derive(Debug)]
pub struct RateLimiter {
    semaphore: Arc<Semaphore>,
    capacity: u32,
    window: Duration,
    saturated: Arc<AtomicBool>,
    saturated_notify: Arc<Notify>,
    refill_task: tokio::task::JoinHandle<()>,
}

impl RateLimiter {
    /// Create a rate limiter allotting `capacity` commands per `window`.
    pub fn new(capacity: u32, window: Duration) -> Self {
        let semaphore = Arc::new(Semaphore::new(capacity as usize));
        let saturated = Arc::new(AtomicBool::new(false));
        let saturated_notify = Arc::new(Notify::new());

        let refill_task = tokio::spawn(Self::run_refill(
            Arc::clone(&semaphore),
            capacity,
            window,
            Arc::clone(&saturated),
        ));

        Self {
            semaphore,
            capacity,
            window,
            saturated,
            saturated_notify,
            refill_task,
        }
    }

    /// Create a rate limiter using the platform's documented default (120
    /// per 60 seconds).
    pub fn default_limits() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }

    async fn run_refill(
        semaphore: Arc<Semaphore>,
        capacity: u32,
        window: Duration,
        saturated: Arc<AtomicBool>,
    ) {
        let mut ticker = time::interval(window);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // First tick fires immediately; the bucket already starts full.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let available = semaphore.available_permits();
            let deficit = capacity.saturating_sub(available as u32);

            if deficit > 0 {
                semaphore.add_permits(deficit as usize);
            }

            saturated.store(false, Ordering::Release);
        }
    }

    /// Acquire one token, suspending until one becomes available if the
    /// bucket is currently exhausted.
    ///
    /// # Panics
    ///
    /// Panics if the internal semaphore has been closed, which this type
    /// never does during its lifetime.
    pub async fn acquire(&self) {
        if let Ok(permit) = self.semaphore.try_acquire() {
            permit.forget();
            return;
        }

        self.saturated.store(true, Ordering::Release);
        self.saturated_notify.notify_waiters();

        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("rate limiter semaphore is never closed");
        permit.forget();
    }

    /// Whether at least one `acquire` call has suspended since the last
    /// window rollover. Exposed for tests that need to observe saturation
    /// without racing on timing.
    pub fn is_saturated(&self) -> bool {
        self.saturated.load(Ordering::Acquire)
    }

    /// Suspend until the bucket becomes saturated.
    pub async fn wait_saturated(&self) {
        loop {
            if self.is_saturated() {
                return;
            }

            let notified = self.saturated_notify.notified();
            if self.is_saturated() {
                return;
            }
            notified.await;
        }
    }

    /// Number of commands allotted per window.
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Length of the rolling window.
    pub const fn window(&self) -> Duration {
        self.window
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.refill_task.abort();
    }
}
