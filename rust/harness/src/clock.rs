//! Wall-clock budget for a single run.
//!
//! Uses `tokio::time::Instant` so tests on a paused runtime see virtual time.

use std::{sync::OnceLock, time::Duration};

use tokio::time::Instant;

/// Countdown against a fixed deadline. A zero deadline means unlimited time.
#[derive(Debug)]
pub struct BudgetClock {
    deadline: Option<Duration>,
    started_at: OnceLock<Instant>,
    stopped_at: OnceLock<Instant>,
}

impl BudgetClock {
    #[must_use]
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline: (!deadline.is_zero()).then_some(deadline),
            started_at: OnceLock::new(),
            stopped_at: OnceLock::new(),
        }
    }

    /// Clock from a seconds value as found in configuration (0 or negative = unlimited).
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            Self::new(Duration::from_secs_f64(secs))
        } else {
            Self::unlimited()
        }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Start the countdown. Calling it again has no effect.
    pub fn start(&self) {
        let _ = self.started_at.set(Instant::now());
    }

    /// Stop the countdown. No effect if never started or already stopped.
    pub fn stop(&self) {
        if self.started_at.get().is_some() {
            let _ = self.stopped_at.set(Instant::now());
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started_at.get().is_some() && self.stopped_at.get().is_none()
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    #[must_use]
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at.get().copied()
    }

    /// Time spent between start and stop (or now, while running).
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        match (self.started_at.get(), self.stopped_at.get()) {
            (None, _) => Duration::ZERO,
            (Some(start), Some(stop)) => stop.duration_since(*start),
            (Some(start), None) => start.elapsed(),
        }
    }

    /// Remaining budget; `None` when unlimited. The full deadline before start.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_sub(self.elapsed()))
    }

    /// Remaining budget in milliseconds, `u64::MAX` when unlimited.
    #[must_use]
    pub fn remaining_ms(&self) -> u64 {
        self.remaining()
            .map_or(u64::MAX, |r| u64::try_from(r.as_millis()).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| self.started_at.get().is_some() && self.elapsed() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_before_start_is_full_deadline() {
        let clock = BudgetClock::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.remaining(), Some(Duration::from_secs(10)));
        assert!(!clock.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown() {
        let clock = BudgetClock::new(Duration::from_secs(10));
        clock.start();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(clock.remaining(), Some(Duration::from_secs(6)));
        assert!(!clock.timed_out());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(clock.remaining(), Some(Duration::ZERO));
        assert!(clock.timed_out());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_are_idempotent() {
        let clock = BudgetClock::new(Duration::from_secs(10));
        clock.stop();
        assert!(!clock.is_running());

        clock.start();
        tokio::time::advance(Duration::from_secs(2)).await;
        clock.start();
        tokio::time::advance(Duration::from_secs(1)).await;
        clock.stop();
        tokio::time::advance(Duration::from_secs(5)).await;
        clock.stop();

        assert_eq!(clock.elapsed(), Duration::from_secs(3));
        assert_eq!(clock.remaining(), Some(Duration::from_secs(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_deadline_is_unlimited() {
        let clock = BudgetClock::from_secs_f64(0.0);
        clock.start();
        tokio::time::advance(Duration::from_secs(100_000)).await;
        assert!(!clock.timed_out());
        assert_eq!(clock.remaining(), None);
        assert_eq!(clock.remaining_ms(), u64::MAX);
    }
}
