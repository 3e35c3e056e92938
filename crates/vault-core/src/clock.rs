//! Time source used by every waiting component.
//!
//! Approval polling and retry backoff never call `tokio::time::sleep`
//! directly; they go through a [`Clock`] so tests can run hours of simulated
//! time without real delays.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::types::Timestamp;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;

    /// Suspend the calling task only; other workers keep running.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `chrono` and the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Simulated clock. `sleep` jumps the clock forward instead of waiting.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            millis: AtomicI64::new(start.0),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2024-01-01T00:00:00Z
        Self::new(Timestamp(1_704_067_200_000))
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.millis.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new(Timestamp(0));
        clock.sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), Timestamp(90_000));
        clock.advance(Duration::from_millis(5));
        assert_eq!(clock.now(), Timestamp(90_005));
    }

    #[tokio::test]
    async fn test_system_clock_is_close_to_now() {
        let clock = SystemClock;
        let before = Timestamp::now();
        clock.sleep(Duration::from_millis(1)).await;
        assert!(clock.now() >= before);
    }
}
