//! Expiry scheduling.
//!
//! Session expiries can sit days or weeks in the future, beyond what a
//! single platform timer can be trusted with (browsers clamp `setTimeout` to
//! a 32-bit millisecond count, and a machine that sleeps mid-wait would
//! otherwise drift). [`schedule_at`] therefore chains bounded waits toward
//! one fixed target timestamp: every wake re-reads the wall clock and
//! re-computes how much real time remains, so the callback fires at the
//! target regardless of how the intervening waits were sliced.
//!
//! [`ExpiryMap`] is the owned bookkeeping for outstanding expiries, keyed by
//! session. It has a single owner (the session store) and is torn down with
//! it, rather than living as ambient module-level timer state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Longest single wait the scheduler will issue. Matches the 32-bit
/// millisecond clamp of the most restrictive embedding; longer delays are
/// chained.
pub const MAX_TIMER_DELAY_MS: u64 = 2_147_483_647;

/// Wall-clock and sleep capability, injected so expiry logic tests under
/// simulated time.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time, milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;

    /// Suspends for `duration`.
    async fn sleep(&self, duration: Duration);
}

#[async_trait]
impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }

    async fn sleep(&self, duration: Duration) {
        (**self).sleep(duration).await;
    }
}

/// [`Clock`] backed by [`SystemTime`] and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before Unix epoch");
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Cancellation handle for one scheduled expiry.
///
/// Idempotent: cancelling twice, or after the callback fired, is a no-op.
#[derive(Debug, Clone)]
pub struct ExpiryHandle {
    token: CancellationToken,
}

impl ExpiryHandle {
    /// Prevents the callback from firing. Takes effect across chained waits:
    /// a cancelled expiry never fires, no matter how many waits remain.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this expiry was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Schedules `callback` to run once the wall clock reaches
/// `target_epoch_ms`, chaining bounded waits as needed.
///
/// A target in the past fires on the next tick of the event loop. The
/// returned handle cancels the expiry; cancellation is idempotent.
pub fn schedule_at<C, F>(clock: C, target_epoch_ms: u64, callback: F) -> ExpiryHandle
where
    C: Clock + 'static,
    F: FnOnce() + Send + 'static,
{
    let token = CancellationToken::new();
    let task_token = token.clone();

    tokio::spawn(async move {
        let mut callback = Some(callback);
        loop {
            let now = clock.now_ms();
            if now >= target_epoch_ms {
                if let Some(callback) = callback.take() {
                    callback();
                }
                return;
            }

            // Re-evaluate remaining real time on every wake; elapsed timer
            // ticks are not trusted across system sleep.
            let remaining = Duration::from_millis((target_epoch_ms - now).min(MAX_TIMER_DELAY_MS));
            tokio::select! {
                () = task_token.cancelled() => {
                    debug!(target_epoch_ms, "scheduled expiry cancelled");
                    return;
                }
                () = clock.sleep(remaining) => {}
            }
        }
    });

    ExpiryHandle { token }
}

/// Owned map of outstanding expiries, keyed by session.
///
/// Replacing or clearing an entry cancels its timer; dropping the map
/// cancels nothing by itself, so owners call [`Self::clear_all`] on
/// teardown.
#[derive(Debug, Default)]
pub struct ExpiryMap {
    handles: Mutex<HashMap<String, ExpiryHandle>>,
}

impl ExpiryMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `handle` under `key`, cancelling any expiry previously tracked
    /// there.
    pub fn put(&self, key: &str, handle: ExpiryHandle) {
        let previous = self
            .handles
            .lock()
            .expect("expiry map mutex poisoned")
            .insert(key.to_string(), handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// Cancels and forgets the expiry under `key`, if any.
    pub fn clear(&self, key: &str) {
        let removed = self
            .handles
            .lock()
            .expect("expiry map mutex poisoned")
            .remove(key);
        if let Some(handle) = removed {
            handle.cancel();
        }
    }

    /// Cancels and forgets every tracked expiry.
    pub fn clear_all(&self) {
        let handles: Vec<_> = {
            let mut handles = self.handles.lock().expect("expiry map mutex poisoned");
            handles.drain().collect()
        };
        for (_, handle) in handles {
            handle.cancel();
        }
    }

    /// Number of tracked expiries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.lock().expect("expiry map mutex poisoned").len()
    }

    /// Whether no expiries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Clock driven by tokio's (pausable) timer, anchored at a fixed epoch.
    #[derive(Clone)]
    struct TestClock {
        epoch_ms: u64,
        started: tokio::time::Instant,
    }

    impl TestClock {
        fn new(epoch_ms: u64) -> Self {
            Self {
                epoch_ms,
                started: tokio::time::Instant::now(),
            }
        }
    }

    #[async_trait]
    impl Clock for TestClock {
        fn now_ms(&self) -> u64 {
            self.epoch_ms + u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
        }

        async fn sleep(&self, duration: Duration) {
            tokio::time::sleep(duration).await;
        }
    }

    async fn advance_chained(total_ms: u64) {
        // Advance in chunks no larger than a single bounded wait, yielding in
        // between so the scheduler task can chain into its next wait.
        let mut remaining = total_ms;
        while remaining > 0 {
            let step = remaining.min(MAX_TIMER_DELAY_MS);
            tokio::time::advance(Duration::from_millis(step)).await;
            for _ in 0..4 {
                tokio::task::yield_now().await;
            }
            remaining -= step;
        }
    }

    const SIXTY_DAYS_MS: u64 = 60 * 24 * 60 * 60 * 1000;

    #[tokio::test(start_paused = true)]
    async fn test_long_delay_fires_once_at_target() {
        let clock = TestClock::new(1_700_000_000_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();

        // 60 days is far beyond a single 2^31-1 ms wait, forcing chaining.
        let target = clock.now_ms() + SIXTY_DAYS_MS;
        let _handle = schedule_at(clock, target, move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        advance_chained(SIXTY_DAYS_MS - 1000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0, "must not fire early");

        advance_chained(2000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "must fire exactly once");

        advance_chained(SIXTY_DAYS_MS).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "must not fire again");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing_across_chained_waits() {
        let clock = TestClock::new(1_700_000_000_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();

        let target = clock.now_ms() + SIXTY_DAYS_MS;
        let handle = schedule_at(clock, target, move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        advance_chained(SIXTY_DAYS_MS / 2).await;
        handle.cancel();
        assert!(handle.is_cancelled());
        handle.cancel(); // idempotent

        advance_chained(SIXTY_DAYS_MS).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_target_fires_immediately() {
        let clock = TestClock::new(1_700_000_000_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();

        let target = clock.now_ms() - 5000;
        let _handle = schedule_at(clock, target, move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_map_replaces_and_clears() {
        let clock = TestClock::new(1_700_000_000_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let map = ExpiryMap::new();

        let fired_a = fired.clone();
        let handle_a = schedule_at(clock.clone(), clock.now_ms() + 10_000, move || {
            fired_a.fetch_add(1, Ordering::SeqCst);
        });
        map.put("session-1", handle_a);
        assert_eq!(map.len(), 1);

        // Replacing the entry cancels the first timer.
        let fired_b = fired.clone();
        let handle_b = schedule_at(clock.clone(), clock.now_ms() + 20_000, move || {
            fired_b.fetch_add(1, Ordering::SeqCst);
        });
        map.put("session-1", handle_b);
        assert_eq!(map.len(), 1);

        advance_chained(15_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        map.clear("session-1");
        assert!(map.is_empty());
        advance_chained(10_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all_cancels_everything() {
        let clock = TestClock::new(1_700_000_000_000);
        let fired = Arc::new(AtomicUsize::new(0));
        let map = ExpiryMap::new();

        for key in ["a", "b", "c"] {
            let fired = fired.clone();
            let handle = schedule_at(clock.clone(), clock.now_ms() + 5000, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            map.put(key, handle);
        }
        assert_eq!(map.len(), 3);

        map.clear_all();
        assert!(map.is_empty());
        advance_chained(10_000).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
