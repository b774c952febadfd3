//! Read-rate limiting
//!
//! Caps how many documents a task pulls from the source per second so
//! a full-collection scan cannot starve the production workload. The
//! window is a fixed second: once the per-window count reaches the
//! cap, `acquire` sleeps until the window rolls over. Approximate by
//! design; bursts inside one window are not smoothed.

use std::time::Duration;
use tokio::time::{sleep_until, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Per-task read-rate limiter. Not shared between tasks.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    consumed: u32,
    window_start: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `capacity` acquisitions per second.
    /// A capacity of 0 disables throttling.
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            consumed: 0,
            window_start: Instant::now(),
        }
    }

    /// Account for one item, sleeping if the current window is spent.
    pub async fn acquire(&mut self) {
        if self.capacity == 0 {
            return;
        }

        let now = Instant::now();
        if now.duration_since(self.window_start) >= WINDOW {
            self.window_start = now;
            self.consumed = 0;
        }

        self.consumed += 1;
        if self.consumed >= self.capacity {
            let next_window = self.window_start + WINDOW;
            sleep_until(next_window).await;
            self.window_start = next_window;
            self.consumed = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_sleeps() {
        let mut limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..10_000 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pauses_at_capacity() {
        let mut limiter = RateLimiter::new(2);
        let start = Instant::now();

        // First window: two items, second one hits the cap and sleeps
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);
        limiter.acquire().await;
        assert_eq!(Instant::now() - start, WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_rate() {
        let mut limiter = RateLimiter::new(100);
        let start = Instant::now();
        for _ in 0..500 {
            limiter.acquire().await;
        }
        // 500 items at 100/s take at least 4 full windows
        assert!(Instant::now() - start >= WINDOW * 4);
        assert!(Instant::now() - start <= WINDOW * 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_when_idle() {
        let mut limiter = RateLimiter::new(2);
        limiter.acquire().await;

        // Sit out a full window; the counter must reset
        tokio::time::sleep(WINDOW * 2).await;
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);
    }
}
