//! Politeness delay between remote calls.

use crate::config::RateLimitConfig;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct State {
    last_request: Option<Instant>,
    last_was_heavy: bool,
}

/// Enforces a minimum interval between remote calls. The interval after a
/// batch longer than `heavy_threshold` is `heavy_delay` instead of `delay`.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<State>,
    delay: Duration,
    heavy_delay: Duration,
    heavy_threshold: usize,
}

impl RateLimiter {
    pub fn new(delay: Duration, heavy_delay: Duration, heavy_threshold: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            delay,
            heavy_delay: heavy_delay.max(delay),
            heavy_threshold,
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.delay_ms),
            Duration::from_millis(cfg.heavy_delay_ms),
            cfg.heavy_threshold,
        )
    }

    /// No delays at all. Handy for in-memory sources.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, usize::MAX)
    }

    /// Blocks until the next call is allowed, then marks the call as made.
    pub async fn wait(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let interval = if state.last_was_heavy {
                self.heavy_delay
            } else {
                self.delay
            };
            let elapsed = last.elapsed();
            if elapsed < interval {
                let wait_time = interval - elapsed;
                tracing::debug!(heavy = state.last_was_heavy, "Rate limiting: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        state.last_request = Some(Instant::now());
        state.last_was_heavy = false;
    }

    /// Reports the size of the batch the last call returned.
    pub async fn record_batch(&self, len: usize) {
        self.state.lock().await.last_was_heavy = len > self.heavy_threshold;
    }
}
