use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::types::{ResilienceError, ResilienceResult};

#[derive(Clone, Copy, Debug)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub time_window: Duration,
    pub enable_warnings: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 20,
            time_window: Duration::from_secs(10),
            enable_warnings: true,
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_requests: u32, time_window: Duration) -> Self {
        Self {
            max_requests,
            time_window,
            ..Self::default()
        }
    }

    pub fn with_warnings(mut self, enable: bool) -> Self {
        self.enable_warnings = enable;
        self
    }
}

/// Exact sliding-window grant log.
///
/// Keeps the timestamp of every grant issued inside the trailing window. A grant
/// issued at `t` stops counting once `now - t >= window`.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    max_requests: u32,
    window: Duration,
    grants: VecDeque<Instant>,
}

impl SlidingWindow {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            grants: VecDeque::with_capacity(max_requests as usize),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.grants.front() {
            if now.saturating_duration_since(*oldest) < self.window {
                break;
            }
            self.grants.pop_front();
        }
    }

    /// Record a grant at `now`, or return how long until the oldest grant leaves the window.
    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), Duration> {
        self.prune(now);
        if self.grants.len() >= self.max_requests as usize {
            let oldest = self.grants.front().copied().unwrap_or(now);
            let wait = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            return Err(wait);
        }
        self.grants.push_back(now);
        Ok(())
    }

    pub fn remaining_at(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.max_requests
            .saturating_sub(self.grants.len().min(u32::MAX as usize) as u32)
    }

    pub fn reset(&mut self) {
        self.grants.clear();
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

/// Async gate that delays callers until the sliding window has room.
#[derive(Debug)]
pub struct RateLimiter {
    enable_warnings: bool,
    window: Mutex<SlidingWindow>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            enable_warnings: config.enable_warnings,
            window: Mutex::new(SlidingWindow::new(config.max_requests, config.time_window)),
        }
    }

    /// Wait until one more request fits in the window, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock();
                match window.try_acquire_at(Instant::now()) {
                    Ok(()) => return,
                    Err(wait) => wait,
                }
            };

            if self.enable_warnings {
                warn!(
                    wait_ms = wait.as_millis().min(u64::MAX as u128) as u64,
                    "rate limit reached, delaying request"
                );
            }

            // Others may expire while we sleep; the loop re-evaluates from scratch.
            tokio::time::sleep(wait).await;
        }
    }

    /// Non-blocking variant of [`RateLimiter::acquire`].
    pub fn try_acquire(&self) -> ResilienceResult<()> {
        let mut window = self.window.lock();
        window
            .try_acquire_at(Instant::now())
            .map_err(|retry_after| ResilienceError::RateLimited {
                message: "rate limit exceeded".to_string(),
                retry_after: Some(retry_after),
            })
    }

    pub fn remaining_requests(&self) -> u32 {
        self.window.lock().remaining_at(Instant::now())
    }

    pub fn reset(&self) {
        self.window.lock().reset();
    }

    pub fn max_requests(&self) -> u32 {
        self.window.lock().max_requests()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn sliding_window_reports_wait_until_oldest_expires() {
        let start = Instant::now();
        let mut window = SlidingWindow::new(2, Duration::from_millis(100));

        assert!(window.try_acquire_at(start).is_ok());
        assert!(window.try_acquire_at(start + Duration::from_millis(30)).is_ok());

        let wait = window
            .try_acquire_at(start + Duration::from_millis(40))
            .expect_err("window should be full");
        assert_eq!(wait, Duration::from_millis(60));

        // Exactly one window after the first grant it no longer counts.
        assert!(window.try_acquire_at(start + Duration::from_millis(100)).is_ok());
        assert_eq!(window.remaining_at(start + Duration::from_millis(100)), 0);
        assert_eq!(window.remaining_at(start + Duration::from_millis(130)), 1);
        assert_eq!(window.remaining_at(start + Duration::from_millis(200)), 2);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut window = SlidingWindow::new(0, Duration::from_millis(10));
        assert_eq!(window.max_requests(), 1);
        assert!(window.try_acquire_at(Instant::now()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_tracks_grants_and_recovers_after_window() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(5, Duration::from_secs(10)));
        assert_eq!(limiter.remaining_requests(), 5);

        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.remaining_requests(), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.remaining_requests(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_capacity() {
        let limiter = RateLimiter::new(
            RateLimiterConfig::new(2, Duration::from_secs(1)).with_warnings(false),
        );
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        // Both earlier grants expired together, only the new one counts.
        assert_eq!(limiter.remaining_requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn grants_never_exceed_budget_in_any_trailing_window() {
        let window = Duration::from_millis(100);
        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::new(3, window).with_warnings(false),
        ));

        let mut grants = Vec::new();
        for i in 0..12u64 {
            if i % 4 == 0 {
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            limiter.acquire().await;
            grants.push(Instant::now());
        }

        for (idx, t) in grants.iter().enumerate() {
            let in_window = grants[..=idx]
                .iter()
                .filter(|g| t.saturating_duration_since(**g) < window)
                .count();
            assert!(in_window <= 3, "grant {idx} saw {in_window} grants in window");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn try_acquire_reports_retry_after_and_reset_clears() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1, Duration::from_millis(50)));
        assert!(limiter.try_acquire().is_ok());

        match limiter.try_acquire() {
            Err(ResilienceError::RateLimited {
                retry_after: Some(retry_after),
                ..
            }) => assert!(retry_after <= Duration::from_millis(50)),
            other => panic!("unexpected result: {other:?}"),
        }

        limiter.reset();
        assert_eq!(limiter.remaining_requests(), 1);
        assert!(limiter.try_acquire().is_ok());
    }
}
