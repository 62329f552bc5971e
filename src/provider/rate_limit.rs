// =============================================================================
// Request Rate Limiter — keeps provider calls under the per-minute ceiling
// =============================================================================
//
// The market-data provider tolerates at most `max_requests` calls in any
// rolling `window` (5 per 60 s by default).  Every fetch awaits `acquire()`
// first; the limiter remembers when the last `max_requests` permits were
// granted and sleeps until the oldest one leaves the window.
//
// When the provider answers "429 Too Many Requests" anyway, `penalize()`
// blocks every caller until the cooldown has passed.
//
// One limiter is shared (via `Arc`) by all tickers in a batch.
// =============================================================================

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Sliding-window limiter shared by every fetch call.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    state: Mutex<LimiterState>,
}

struct LimiterState {
    /// Grant instants still inside the window, oldest first.
    granted: VecDeque<Instant>,
    /// Provider-imposed cooldown, if any.
    blocked_until: Option<Instant>,
    total_granted: u64,
    total_throttled: u64,
}

/// Serialisable view of the limiter for the status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub max_requests: usize,
    pub window_secs: u64,
    pub in_window: usize,
    pub total_granted: u64,
    pub total_throttled: u64,
    pub cooldown_remaining_ms: u64,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per rolling `window`.
    /// A `max_requests` of zero is treated as one.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            max_requests,
            window,
            state: Mutex::new(LimiterState {
                granted: VecDeque::with_capacity(max_requests),
                blocked_until: None,
                total_granted: 0,
                total_throttled: 0,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Permits
    // -------------------------------------------------------------------------

    /// Wait until one more request fits in the window, then record it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                match self.required_wait(&mut state, now) {
                    None => {
                        state.granted.push_back(now);
                        state.total_granted += 1;
                        return;
                    }
                    Some(wait) => {
                        state.total_throttled += 1;
                        wait
                    }
                }
            };

            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// How long a caller arriving at `now` must wait, or `None` if it may go.
    fn required_wait(&self, state: &mut LimiterState, now: Instant) -> Option<Duration> {
        while let Some(&oldest) = state.granted.front() {
            if now.duration_since(oldest) >= self.window {
                state.granted.pop_front();
            } else {
                break;
            }
        }

        let cooldown = state
            .blocked_until
            .filter(|&until| until > now)
            .map(|until| until - now);
        if cooldown.is_none() {
            state.blocked_until = None;
        }

        let window_full = if state.granted.len() >= self.max_requests {
            state
                .granted
                .front()
                .map(|&oldest| self.window.saturating_sub(now.duration_since(oldest)))
        } else {
            None
        };

        cooldown.max(window_full)
    }

    /// Block all callers for at least `cooldown` (provider said "slow down").
    pub fn penalize(&self, cooldown: Duration) {
        let until = Instant::now() + cooldown;
        let mut state = self.state.lock();
        if state.blocked_until.map_or(true, |current| until > current) {
            state.blocked_until = Some(until);
        }
        warn!(cooldown_ms = cooldown.as_millis() as u64, "provider rate limit hit, pausing all fetches");
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let state = self.state.lock();
        let now = Instant::now();
        RateLimitSnapshot {
            max_requests: self.max_requests,
            window_secs: self.window.as_secs(),
            in_window: state
                .granted
                .iter()
                .filter(|&&t| now.duration_since(t) < self.window)
                .count(),
            total_granted: state.total_granted,
            total_throttled: state.total_throttled,
            cooldown_remaining_ms: state
                .blocked_until
                .map_or(0, |until| until.saturating_duration_since(now).as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RateLimiter")
            .field("max_requests", &self.max_requests)
            .field("window", &self.window)
            .field("in_window", &state.granted.len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_permits_are_immediate() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.snapshot().in_window, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn sixth_permit_waits_for_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..6 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(61));
        let snap = limiter.snapshot();
        assert_eq!(snap.total_granted, 6);
        assert!(snap.total_throttled >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_max_in_any_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();
        let mut grants = Vec::new();
        for i in 0..17 {
            if i % 4 == 0 {
                tokio::time::advance(Duration::from_secs(7)).await;
            }
            limiter.acquire().await;
            grants.push(start.elapsed());
        }
        for (i, &t) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .take_while(|&&u| u < t + Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "{in_window} grants within 60s of {t:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn penalty_blocks_everyone() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        limiter.penalize(Duration::from_secs(30));
        assert!(limiter.snapshot().cooldown_remaining_ms > 0);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(limiter.snapshot().cooldown_remaining_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_penalty_does_not_shorten_cooldown() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        limiter.penalize(Duration::from_secs(30));
        limiter.penalize(Duration::from_secs(5));

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.snapshot().max_requests, 1);
    }
}
