//! Shared outbound HTTP client with concurrency limits, failure classification and backoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Whether a failed request may be attempted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    /// Authentication or account-level quota; retrying cannot succeed this run.
    Fatal,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::PAYMENT_REQUIRED | StatusCode::FORBIDDEN => {
            RetryDisposition::Fatal
        }
        _ => RetryDisposition::Retryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_builder() {
        return RetryDisposition::Fatal;
    }
    match err.status() {
        Some(status) => classify_status(status),
        None => RetryDisposition::Retryable,
    }
}

/// Exponential backoff with additive random jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Deterministic delay before retry number `attempt_index + 1`.
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .checked_pow(attempt_index)
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: u32) -> Duration {
        let base = self.delay_for_attempt(attempt_index);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_channel_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_channel_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            FetchError::Closed => RetryDisposition::Fatal,
        }
    }
}

/// Single-attempt fetcher. Retries belong to the acquisition layer, which owns the budget.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_channel_limit: usize,
    per_channel: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_channel_limit: config.per_channel_concurrency.max(1),
            per_channel: Mutex::new(HashMap::new()),
        })
    }

    async fn channel_semaphore(&self, channel: &str) -> Arc<Semaphore> {
        let mut map = self.per_channel.lock().await;
        map.entry(channel.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_channel_limit)))
            .clone()
    }

    /// GETs `url` with query `params`. Non-2xx statuses come back as [`FetchError::HttpStatus`]
    /// carrying the response body so callers can inspect upstream error messages.
    pub async fn get(
        &self,
        channel: &str,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_channel = self.channel_semaphore(channel).await;
        let _channel = per_channel.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", channel, url);
        async {
            let resp = self.client.get(url).query(params).send().await?;
            let status = resp.status();
            let final_url = resp.url().path().to_string();
            debug!(status = status.as_u16(), "received response");

            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            let body = resp.text().await.unwrap_or_default();
            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            multiplier: 2,
            max_delay: Duration::from_secs(5),
            jitter: Duration::ZERO,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(5));
        assert_eq!(policy.jittered_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: Duration::from_millis(200),
            ..BackoffPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn max_attempts_never_drops_below_one() {
        assert_eq!(BackoffPolicy::default().with_max_attempts(0).max_attempts, 1);
        assert_eq!(BackoffPolicy::default().with_max_attempts(4).max_attempts, 4);
    }

    #[test]
    fn auth_and_billing_statuses_are_fatal() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), RetryDisposition::Fatal);
        assert_eq!(classify_status(StatusCode::PAYMENT_REQUIRED), RetryDisposition::Fatal);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Fatal);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
    }

    #[test]
    fn status_errors_report_their_disposition() {
        let err = FetchError::HttpStatus {
            status: 401,
            url: "/search.json".into(),
            body: String::new(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Fatal);
        assert_eq!(FetchError::Closed.disposition(), RetryDisposition::Fatal);
    }
}
