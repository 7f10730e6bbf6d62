//! Retry with exponential backoff behind a circuit breaker.

use crate::config::CacheConfig;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    /// Delay before retry `n` is `base^n` seconds
    pub backoff_base_seconds: u64,
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_secs(self.backoff_base_seconds.saturating_pow(retry))
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and rejects calls for
/// `open_for`; the first call after that is let through as a trial.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    open_for: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, open_for: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn allow(&self) -> bool {
        let mut state = self.lock();
        match state.opened_at {
            Some(opened) if opened.elapsed() < self.open_for => false,
            Some(_) => {
                // Half open: one trial call, a failure re-opens immediately.
                state.opened_at = None;
                state.consecutive_failures = self.threshold.saturating_sub(1);
                true
            }
            None => true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock()
            .opened_at
            .is_some_and(|opened| opened.elapsed() < self.open_for)
    }

    pub fn record_success(&self) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            tracing::warn!(
                "Cache circuit opened after {} consecutive failure(s)",
                state.consecutive_failures
            );
            state.opened_at = Some(Instant::now());
        }
    }
}

/// Retry policy and circuit breaker shared by every call to one store.
#[derive(Debug)]
pub struct Resilience {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
}

impl Resilience {
    pub fn new(retry: RetryPolicy, breaker: CircuitBreaker) -> Self {
        Self { retry, breaker }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            RetryPolicy {
                retries: config.retries,
                backoff_base_seconds: config.backoff_base_seconds,
            },
            CircuitBreaker::new(
                config.breaker_failures,
                Duration::from_secs(config.breaker_open_seconds),
            ),
        )
    }

    /// Run `attempt` until it succeeds, retries run out or the circuit opens.
    /// `None` means the operation was given up.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        for retry in 0..=self.retry.retries {
            if retry > 0 {
                tokio::time::sleep(self.retry.delay(retry)).await;
            }
            if !self.breaker.allow() {
                tracing::warn!("{} skipped: cache circuit is open", operation);
                return None;
            }
            match attempt().await {
                Ok(value) => {
                    self.breaker.record_success();
                    return Some(value);
                }
                Err(e) => {
                    self.breaker.record_failure();
                    tracing::debug!(
                        "{} failed (attempt {}/{}): {:#}",
                        operation,
                        retry + 1,
                        self.retry.retries + 1,
                        e
                    );
                }
            }
        }
        tracing::warn!(
            "{} failed after {} attempt(s), continuing without cache",
            operation,
            self.retry.retries + 1
        );
        None
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
