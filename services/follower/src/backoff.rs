//! HTTP transport that retries transport-level failures with bounded
//! exponential backoff.
//!
//! The retry budget is measured from the start of each logical request: once
//! the next wake-up would land past `start + max_delay` the request fails
//! without sleeping. The shutdown signal cancels both in-flight requests and
//! pending sleeps.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::supervisor::wait_for_shutdown;

/// Delay schedule for retries.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Factor applied to the previous delay on each further retry.
    pub multiplier: f64,
    /// Upper bound for one delay, and the total retry budget.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            multiplier: 1.6,
            max_delay: Duration::from_secs(120),
        }
    }
}

impl BackoffConfig {
    /// Delay before retry number `retries` (0-based).
    pub fn delay(&self, retries: u32) -> Duration {
        if retries == 0 {
            return self.base_delay;
        }
        let max = self.max_delay.as_secs_f64();
        let mut backoff = self.base_delay.as_secs_f64();
        let mut remaining = retries;
        while backoff < max && remaining > 0 {
            backoff *= self.multiplier;
            remaining -= 1;
        }
        let backoff = backoff.min(max).max(0.0);
        Duration::from_secs_f64(backoff)
    }
}

/// A response as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure: the request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// Minimal GET transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

#[async_trait]
impl Transport for reqwest::Client {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let response = reqwest::Client::get(self, url)
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;
        Ok(TransportResponse { status, body })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("request cancelled")]
    Cancelled,

    #[error("timed out after {attempts} attempts over {elapsed:?}: {last_error}")]
    Timeout {
        attempts: u32,
        elapsed: Duration,
        last_error: TransportError,
    },
}

/// Retrying decorator over a [`Transport`].
pub struct BackoffTransport<T> {
    inner: T,
    config: BackoffConfig,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> BackoffTransport<T> {
    pub fn new(inner: T, config: BackoffConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            inner,
            config,
            shutdown,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// GET `url`, retrying transport failures until the budget is spent.
    pub async fn get(&self, url: &str) -> Result<TransportResponse, BackoffError> {
        let mut shutdown = self.shutdown.clone();
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let result = tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Err(BackoffError::Cancelled),
                result = self.inner.get(url) => result,
            };

            let error = match result {
                Ok(response) => {
                    debug!(url = %url, attempt, status = response.status, "Request completed");
                    return Ok(response);
                }
                Err(error) => error,
            };

            if *shutdown.borrow() {
                return Err(BackoffError::Cancelled);
            }

            let delay = self.config.delay(attempt);
            let now = Instant::now();
            if now + delay > start + self.config.max_delay {
                return Err(BackoffError::Timeout {
                    attempts: attempt + 1,
                    elapsed: now - start,
                    last_error: error,
                });
            }

            warn!(
                url = %url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Request failed, retrying"
            );

            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => return Err(BackoffError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
