//! Grace-period timers.
//!
//! Each timer is a spawned task that sleeps for the grace period and then
//! runs its fire callback. The handle lives in the owning user's slot, so
//! starting a timer through [`GraceTimers::start`] always aborts the one
//! it replaces. A fire callback receives the timer ID and must check that
//! the ID is still current before acting: abort and fire can race.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use super::clock::deadline_after;

/// Default grace period (5 minutes).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(300);

/// Handle to one scheduled grace timer.
#[derive(Debug)]
pub struct GraceTimer {
    id: u64,
    channel_id: String,
    deadline: Instant,
    handle: AbortHandle,
}

impl GraceTimer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Aborts the sleeping task. Safe after the task has finished.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Schedules grace timers into per-user slots.
#[derive(Debug)]
pub struct GraceTimers {
    period: Duration,
    next_id: AtomicU64,
}

impl GraceTimers {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Starts a timer in `slot`, cancelling whatever was there.
    ///
    /// `on_fire` is called with the new timer's ID once the period elapses.
    pub fn start<F, Fut>(
        &self,
        slot: &mut Option<GraceTimer>,
        channel_id: &str,
        on_fire: F,
    ) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::cancel(slot);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = deadline_after(self.period);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            on_fire(id).await;
        });

        *slot = Some(GraceTimer {
            id,
            channel_id: channel_id.to_string(),
            deadline,
            handle: task.abort_handle(),
        });
        id
    }

    /// Cancels the timer in `slot`, if any. Returns whether one was present.
    pub fn cancel(slot: &mut Option<GraceTimer>) -> bool {
        match slot.take() {
            Some(timer) => {
                tracing::trace!(timer_id = timer.id, "Grace timer cancelled");
                timer.cancel();
                true
            }
            None => false,
        }
    }
}

impl Default for GraceTimers {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::advance;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn record(
        fired: &Arc<Mutex<Vec<u64>>>,
    ) -> impl FnOnce(u64) -> std::future::Ready<()> + Send + 'static {
        let sink = Arc::clone(fired);
        move |id| {
            sink.lock().unwrap().push(id);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_period() {
        let timers = GraceTimers::new(Duration::from_secs(300));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut slot = None;

        let id = timers.start(&mut slot, "vc", record(&fired));
        assert_eq!(slot.as_ref().map(GraceTimer::channel_id), Some("vc"));

        advance(Duration::from_secs(299)).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty());

        advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(*fired.lock().unwrap(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_supersedes_previous_timer() {
        let timers = GraceTimers::new(Duration::from_secs(300));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut slot = None;

        let first = timers.start(&mut slot, "vc", record(&fired));
        advance(Duration::from_secs(120)).await;
        let second = timers.start(&mut slot, "vc", record(&fired));
        assert_ne!(first, second);

        advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(*fired.lock().unwrap(), vec![second]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire_and_is_idempotent() {
        let timers = GraceTimers::default();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut slot = None;

        timers.start(&mut slot, "vc", record(&fired));
        assert!(GraceTimers::cancel(&mut slot));
        assert!(!GraceTimers::cancel(&mut slot));

        advance(DEFAULT_GRACE_PERIOD * 2).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_fire_is_harmless() {
        let timers = GraceTimers::new(Duration::from_secs(1));
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut slot = None;

        timers.start(&mut slot, "vc", record(&fired));
        advance(Duration::from_secs(2)).await;
        settle().await;

        assert_eq!(fired.lock().unwrap().len(), 1);
        assert!(GraceTimers::cancel(&mut slot));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_period_never_fires() {
        let timers = GraceTimers::new(Duration::MAX);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let mut slot = None;

        timers.start(&mut slot, "vc", record(&fired));
        assert!(slot.as_ref().unwrap().deadline() > Instant::now());

        advance(Duration::from_secs(86_400 * 7)).await;
        settle().await;
        assert!(fired.lock().unwrap().is_empty());
        assert!(GraceTimers::cancel(&mut slot));
    }
}
