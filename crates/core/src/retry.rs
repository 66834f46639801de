//! Retry with exponential backoff for transient sync failures.

use crate::config::SyncConfig;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_attempts: usize,
}

impl RetryConfig {
    pub fn from_sync(cfg: &SyncConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms),
            factor: 2.0,
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 3,
        }
    }
}

/// Runs `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or `max_attempts` is used up.
pub async fn retry<F, Fut, T, E, R>(
    operation_name: &str,
    config: &RetryConfig,
    should_retry: R,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    R: Fn(&E) -> bool,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if !should_retry(&err) || attempts >= config.max_attempts {
                    return Err(err);
                }
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_attempts, err, delay
                );
                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
