//! Wall-clock source for session accounting.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Fallback horizon when `now + period` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + period`, saturating at a far-future instant.
pub(crate) fn deadline_after(period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(period)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Supplies "now" to the session ledger.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock anchored once and advanced by the runtime's monotonic clock.
///
/// Session durations therefore follow `tokio::time`, which also drives the
/// grace timers, and a paused test runtime moves both together.
#[derive(Debug, Clone)]
pub struct RuntimeClock {
    wall_anchor: DateTime<Utc>,
    instant_anchor: Instant,
}

impl RuntimeClock {
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    pub fn anchored_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            wall_anchor,
            instant_anchor: Instant::now(),
        }
    }
}

impl Default for RuntimeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RuntimeClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.instant_anchor.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_anchor + elapsed
    }
}
