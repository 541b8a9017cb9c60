//! Backoff policy for backend calls and failed queue records.
//!
//! Two clocks share one policy: a submission hitting a 5xx is retried in
//! place a few times with short sleeps, and a record that still failed is
//! only requeued once its per-record backoff has elapsed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use fieldsync_common::{Error, QueuedRecord, Result};

/// Retry and backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// In-place retries for one backend call, after the first attempt.
    pub max_retries: u32,
    /// Backoff after the first failure.
    pub initial_delay_ms: u64,
    /// Ceiling for the backoff.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Spread in-place sleeps by +/- 25%.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff after `failures` consecutive failures, without jitter.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(64) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Sleep before in-place retry number `retry` (1-based).
    fn sleep_before(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter {
            return base;
        }
        base.mul_f64(0.75 + rand::random::<f64>() * 0.5)
    }

    /// Whether a failed record has waited out its backoff.
    ///
    /// Records are never given up on; past `max_delay_ms` they are retried at
    /// that pace indefinitely.
    pub fn is_due(&self, record: &QueuedRecord, now: DateTime<Utc>) -> bool {
        let Some(last_attempt) = record.last_attempt else {
            return true;
        };
        match chrono::Duration::from_std(self.backoff(record.failure_count)) {
            Ok(wait) => now - last_attempt >= wait,
            Err(_) => false,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Runs backend calls, retrying server-side failures in place.
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `call`, retrying 5xx and I/O failures up to `max_retries` times.
    ///
    /// Everything else, an unreachable backend included, is returned at
    /// once; the queue decides when that record is tried again.
    pub async fn execute<F, Fut, T>(&self, call: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut retries = 0;
        loop {
            let err = match call().await {
                Ok(value) => {
                    if retries > 0 {
                        debug!("Backend call succeeded on retry {}", retries);
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !Self::is_retryable(&err) || retries >= self.config.max_retries {
                if retries > 0 {
                    warn!("Backend call still failing after {} retries: {}", retries, err);
                }
                return Err(err);
            }

            retries += 1;
            let delay = self.config.sleep_before(retries);
            warn!(
                "Backend call failed ({}); retry {}/{} in {:?}",
                err, retries, self.config.max_retries, delay
            );
            sleep(delay).await;
        }
    }

    fn is_retryable(err: &Error) -> bool {
        match err {
            Error::Backend { status, .. } => *status >= 500,
            Error::Io(_) => true,
            _ => false,
        }
    }
}
