//! Drives retrieval channels for one (city, niche) pair.
//!
//! Channels are tried in priority order. Each one is polled through a
//! [`PaginationController`] with per-request timeout, jittered backoff and a politeness pause
//! before every outbound call. A fatal error disables the channel for the rest of the run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lbof_adapters::{ChannelError, ChannelPage, ChannelQuery, ChannelShape, RetrievalChannel};
use lbof_core::fingerprint::SeenFingerprints;
use lbof_core::{CityNiche, RawBusinessRecord, SourceChannel};
use lbof_storage::BackoffPolicy;
use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pagination::{ExhaustionReason, PaginationController, PaginationState};

/// Randomized pause inserted before every outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolitenessDelay {
    pub min: Duration,
    pub max: Duration,
}

impl PolitenessDelay {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let span = (self.max - self.min).as_millis() as u64;
        self.min + Duration::from_millis(rand::rng().random_range(0..=span))
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionPolicy {
    pub backoff: BackoffPolicy,
    /// Overrides each channel's own attempt budget when set.
    pub max_attempts: Option<u32>,
    pub request_timeout: Duration,
    pub politeness: PolitenessDelay,
    pub stall_polls: u32,
    pub max_pages: u32,
    pub max_polls: u32,
}

impl Default for AcquisitionPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: None,
            request_timeout: Duration::from_secs(60),
            politeness: PolitenessDelay::new(Duration::from_secs(1), Duration::from_secs(3)),
            stall_polls: 20,
            max_pages: 10,
            max_polls: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Exhausted(ExhaustionReason),
    /// Retry budget for a page ran out.
    Failed(String),
    Fatal(String),
    /// Disabled earlier in the run by a fatal error.
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub channel: SourceChannel,
    pub outcome: ChannelOutcome,
    pub requests: u32,
    pub pages: u32,
    pub records: usize,
    pub duplicates: usize,
    pub invalid: usize,
}

impl ChannelReport {
    fn new(channel: SourceChannel, outcome: ChannelOutcome) -> Self {
        Self {
            channel,
            outcome,
            requests: 0,
            pages: 0,
            records: 0,
            duplicates: 0,
            invalid: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AcquisitionOutcome {
    pub key: CityNiche,
    pub records: Vec<RawBusinessRecord>,
    pub reports: Vec<ChannelReport>,
}

impl AcquisitionOutcome {
    /// Some channel ran its stream to a clean end.
    pub fn is_complete(&self) -> bool {
        self.reports
            .iter()
            .any(|r| matches!(r.outcome, ChannelOutcome::Exhausted(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("acquisition cancelled")]
    Cancelled,
}

/// Records accepted for one pair across every channel tried.
struct PairBatch {
    seen: SeenFingerprints,
    records: Vec<RawBusinessRecord>,
}

impl PairBatch {
    fn new() -> Self {
        Self {
            seen: SeenFingerprints::new(),
            records: Vec::new(),
        }
    }

    /// False when the fingerprint was already taken this session.
    fn admit(&mut self, record: RawBusinessRecord) -> bool {
        if !self.seen.first_sighting(&record.fingerprint) {
            return false;
        }
        self.records.push(record);
        true
    }
}

enum PageError {
    Cancelled,
    Fatal(String),
    Exhausted(String),
}

pub struct AcquisitionOrchestrator {
    channels: Vec<Arc<dyn RetrievalChannel>>,
    policy: AcquisitionPolicy,
    disabled: Mutex<HashSet<usize>>,
}

impl AcquisitionOrchestrator {
    pub fn new(channels: Vec<Arc<dyn RetrievalChannel>>, policy: AcquisitionPolicy) -> Self {
        Self {
            channels,
            policy,
            disabled: Mutex::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> &AcquisitionPolicy {
        &self.policy
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub async fn disabled_channels(&self) -> Vec<SourceChannel> {
        let disabled = self.disabled.lock().await;
        let mut out = self
            .channels
            .iter()
            .enumerate()
            .filter(|(idx, _)| disabled.contains(idx))
            .map(|(_, c)| c.source_channel())
            .collect::<Vec<_>>();
        out.sort();
        out
    }

    pub async fn acquire(
        &self,
        key: &CityNiche,
        cancel: &CancellationToken,
    ) -> Result<AcquisitionOutcome, AcquisitionError> {
        let query = ChannelQuery::new(key.niche.clone(), key.city.clone());
        let mut batch = PairBatch::new();
        let mut reports = Vec::new();

        for (idx, channel) in self.channels.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AcquisitionError::Cancelled);
            }
            if self.disabled.lock().await.contains(&idx) {
                debug!(channel = %channel.source_channel(), "channel disabled for this run");
                reports.push(ChannelReport::new(
                    channel.source_channel(),
                    ChannelOutcome::Disabled,
                ));
                continue;
            }

            let report = self
                .drain_channel(idx, channel.as_ref(), key, &query, &mut batch, cancel)
                .await?;
            let collected = report.records;
            info!(
                pair = %key,
                channel = %report.channel,
                outcome = ?report.outcome,
                requests = report.requests,
                records = report.records,
                duplicates = report.duplicates,
                invalid = report.invalid,
                "channel finished"
            );
            reports.push(report);
            if collected > 0 {
                break;
            }
        }

        Ok(AcquisitionOutcome {
            key: key.clone(),
            records: batch.records,
            reports,
        })
    }

    async fn drain_channel(
        &self,
        idx: usize,
        channel: &dyn RetrievalChannel,
        key: &CityNiche,
        query: &ChannelQuery,
        batch: &mut PairBatch,
        cancel: &CancellationToken,
    ) -> Result<ChannelReport, AcquisitionError> {
        let source = channel.source_channel();
        let max_pages = match channel.shape() {
            ChannelShape::Bounded { .. } => self.policy.max_pages,
            ChannelShape::OpenEnded => self.policy.max_polls,
        };
        let mut controller =
            PaginationController::new(channel.shape(), self.policy.stall_polls, max_pages);
        let attempts = self
            .policy
            .max_attempts
            .unwrap_or_else(|| channel.max_attempts())
            .max(1);
        let mut report = ChannelReport::new(source, ChannelOutcome::Failed(String::new()));

        while controller.is_polling() {
            let token = controller.next_token().map(ToString::to_string);
            match self
                .fetch_with_retry(channel, query, token.as_deref(), attempts, &mut report, cancel)
                .await
            {
                Ok(page) => {
                    controller.observe(&page);
                    let discovered_at = Utc::now();
                    for payload in page.payloads {
                        match RawBusinessRecord::from_payload(key, payload, source, discovered_at) {
                            Ok(record) => {
                                if batch.admit(record) {
                                    report.records += 1;
                                } else {
                                    report.duplicates += 1;
                                }
                            }
                            Err(err) => {
                                debug!(pair = %key, error = %err, "dropping payload");
                                report.invalid += 1;
                            }
                        }
                    }
                }
                Err(PageError::Cancelled) => {
                    channel.finish(token.as_deref()).await;
                    return Err(AcquisitionError::Cancelled);
                }
                Err(PageError::Fatal(message)) => {
                    warn!(pair = %key, channel = %source, %message, "channel disabled for the rest of the run");
                    self.disabled.lock().await.insert(idx);
                    controller.fail();
                    report.outcome = ChannelOutcome::Fatal(message);
                }
                Err(PageError::Exhausted(message)) => {
                    warn!(pair = %key, channel = %source, %message, "retry budget exhausted");
                    controller.fail();
                    report.outcome = ChannelOutcome::Failed(message);
                }
            }
        }

        report.pages = controller.pages();
        if let PaginationState::Exhausted(reason) = controller.state() {
            report.outcome = ChannelOutcome::Exhausted(*reason);
        }
        channel.finish(controller.next_token()).await;
        Ok(report)
    }

    async fn fetch_with_retry(
        &self,
        channel: &dyn RetrievalChannel,
        query: &ChannelQuery,
        token: Option<&str>,
        attempts: u32,
        report: &mut ChannelReport,
        cancel: &CancellationToken,
    ) -> Result<ChannelPage, PageError> {
        let mut last_error = String::new();
        for attempt in 0..attempts {
            pause(self.policy.politeness.sample(), cancel).await?;
            report.requests += 1;

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(PageError::Cancelled),
                r = tokio::time::timeout(self.policy.request_timeout, channel.fetch_page(query, token)) => r,
            };
            let err = match result {
                Ok(Ok(page)) => return Ok(page),
                Ok(Err(err)) => err,
                Err(_) => ChannelError::Transient(format!(
                    "no response within {:?}",
                    self.policy.request_timeout
                )),
            };
            if let ChannelError::Fatal(message) = err {
                return Err(PageError::Fatal(message));
            }

            last_error = err.to_string();
            debug!(attempt = attempt + 1, attempts, error = %last_error, "transient channel error");
            if attempt + 1 < attempts {
                pause(self.policy.backoff.jittered_delay(attempt), cancel).await?;
            }
        }
        Err(PageError::Exhausted(last_error))
    }
}

async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), PageError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(PageError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(PageError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}
