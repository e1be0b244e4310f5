//! Run orchestration: configuration, pair selection, the run controller and its scheduler.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use lbof_adapters::{
    CardExtractor, FixtureSurfaceDriver, InteractiveChannel, RetrievalChannel, SerpApiChannel,
};
use lbof_core::scoring::{build_metric, ScoringConfig};
use lbof_core::{Classification, CityNiche, OpportunityMetric, RunHistoryEntry};
use lbof_storage::{
    BackoffPolicy, CacheLedger, ConsolidationStore, HttpClientConfig, HttpFetcher, StoreError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod acquisition;
pub mod cache;
pub mod export;
pub mod pagination;

pub use acquisition::{
    AcquisitionError, AcquisitionOrchestrator, AcquisitionOutcome, AcquisitionPolicy,
    ChannelOutcome, ChannelReport, PolitenessDelay,
};
pub use cache::{FreshnessGate, GateDecision};
pub use export::{
    best_opportunities, compare_niches, export_niche_companies, export_snapshots, niche_companies,
    NicheComparison, NicheCompanies,
};
pub use pagination::{ExhaustionReason, PaginationController, PaginationState};

pub const CRATE_NAME: &str = "lbof-sync";

pub const CHANNEL_SERPAPI: &str = "serpapi";
pub const CHANNEL_FIXTURE_INTERACTIVE: &str = "fixture-interactive";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("no (city, niche) pairs to process")]
    EmptyPairs,
    #[error("{name} must be finite and non-negative, got {value}")]
    InvalidWeight { name: &'static str, value: f64 },
    #[error("thresholds must satisfy 0 <= medium ({medium}) <= high ({high}) <= 1")]
    InvalidThresholds { medium: f64, high: f64 },
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    #[error("politeness delay min {min}ms exceeds max {max}ms")]
    InvalidDelay { min: u64, max: u64 },
    #[error("no channels configured")]
    NoChannels,
    #[error("unknown channel kind {0:?}")]
    UnknownChannel(String),
    #[error("channel {0:?} requires a path")]
    MissingChannelPath(String),
    #[error("SERPAPI_API_KEY must be set to use the serpapi channel")]
    MissingApiKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayRangeMs {
    pub min: u64,
    pub max: u64,
}

impl Default for DelayRangeMs {
    fn default() -> Self {
        Self { min: 1000, max: 3000 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ChannelSpec {
    pub fn serpapi() -> Self {
        Self {
            kind: CHANNEL_SERPAPI.to_string(),
            path: None,
        }
    }
}

/// Immutable settings for one run, loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunConfig {
    pub cities: Vec<String>,
    pub niches: Vec<String>,
    #[serde(flatten)]
    pub scoring: ScoringConfig,
    pub cache_ttl_days: u32,
    /// Attempts per page; each channel's own default applies when unset.
    pub max_retries: Option<u32>,
    pub max_pages: u32,
    pub max_polls: u32,
    pub stall_polls: u32,
    pub concurrency: usize,
    pub politeness_delay_ms: DelayRangeMs,
    pub request_timeout_secs: u64,
    pub best_score_threshold: f64,
    pub neighbour_cities: Vec<String>,
    pub channels: Vec<ChannelSpec>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cities: Vec::new(),
            niches: Vec::new(),
            scoring: ScoringConfig::default(),
            cache_ttl_days: 30,
            max_retries: None,
            max_pages: 10,
            max_polls: 200,
            stall_polls: 20,
            concurrency: 4,
            politeness_delay_ms: DelayRangeMs::default(),
            request_timeout_secs: 60,
            best_score_threshold: 0.63,
            neighbour_cities: Vec::new(),
            channels: vec![ChannelSpec::serpapi()],
        }
    }
}

impl RunConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let weights = [
            ("demandWeight", self.scoring.demand_weight),
            ("competitionWeight", self.scoring.competition_weight),
            ("satisfactionWeight", self.scoring.satisfaction_weight),
            ("bestScoreThreshold", self.best_score_threshold),
        ];
        for (name, value) in weights {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidWeight { name, value });
            }
        }

        let ScoringConfig {
            medium_threshold: medium,
            high_threshold: high,
            ..
        } = self.scoring;
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !in_unit(medium) || !in_unit(high) || medium > high {
            return Err(ConfigError::InvalidThresholds { medium, high });
        }

        if self.max_retries == Some(0) {
            return Err(ConfigError::Zero("maxRetries"));
        }
        for (name, value) in [
            ("maxPages", self.max_pages as usize),
            ("maxPolls", self.max_polls as usize),
            ("stallPolls", self.stall_polls as usize),
            ("concurrency", self.concurrency),
            ("requestTimeoutSecs", self.request_timeout_secs as usize),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let DelayRangeMs { min, max } = self.politeness_delay_ms;
        if min > max {
            return Err(ConfigError::InvalidDelay { min, max });
        }

        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        for channel in &self.channels {
            match channel.kind.as_str() {
                CHANNEL_SERPAPI => {}
                CHANNEL_FIXTURE_INTERACTIVE if channel.path.is_none() => {
                    return Err(ConfigError::MissingChannelPath(channel.kind.clone()));
                }
                CHANNEL_FIXTURE_INTERACTIVE => {}
                other => return Err(ConfigError::UnknownChannel(other.to_string())),
            }
        }
        Ok(())
    }

    pub fn acquisition_policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy {
            backoff: BackoffPolicy::default(),
            max_attempts: self.max_retries,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            politeness: PolitenessDelay::new(
                Duration::from_millis(self.politeness_delay_ms.min),
                Duration::from_millis(self.politeness_delay_ms.max),
            ),
            stall_polls: self.stall_polls,
            max_pages: self.max_pages,
            max_polls: self.max_polls,
        }
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
    pub serpapi_api_key: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            config_path: std::env::var("LBOF_CONFIG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./lbof.yaml")),
            data_dir: std::env::var("LBOF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            serpapi_api_key: std::env::var("SERPAPI_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            scheduler_enabled: std::env::var("LBOF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("LBOF_SYNC_CRON").unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("LBOF_USER_AGENT")
                .unwrap_or_else(|_| "lbof-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("LBOF_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }
}

/// Supplies the (city, niche) pairs a run iterates.
pub trait PairSource {
    fn pairs(&self) -> Vec<CityNiche>;
}

/// Every configured city crossed with every configured niche, city-major.
#[derive(Debug, Clone)]
pub struct StaticPairs {
    cities: Vec<String>,
    niches: Vec<String>,
}

impl StaticPairs {
    pub fn new(cities: Vec<String>, niches: Vec<String>) -> Self {
        Self { cities, niches }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.cities.clone(), config.niches.clone())
    }
}

impl PairSource for StaticPairs {
    fn pairs(&self) -> Vec<CityNiche> {
        let pairs = self
            .cities
            .iter()
            .flat_map(|city| {
                self.niches
                    .iter()
                    .map(move |niche| CityNiche::new(city.clone(), niche.clone()))
            })
            .collect::<Vec<_>>();
        dedup_pairs(pairs)
    }
}

/// Niches that already score well, re-tested in neighbouring cities.
#[derive(Debug, Clone)]
pub struct BestOpportunityPairs {
    niches: Vec<String>,
    cities: Vec<String>,
}

impl BestOpportunityPairs {
    pub fn from_metrics(
        metrics: &[OpportunityMetric],
        threshold: f64,
        neighbour_cities: Vec<String>,
    ) -> Self {
        let mut seen = HashSet::new();
        let niches = best_opportunities(metrics, threshold)
            .into_iter()
            .map(|m| m.niche)
            .filter(|niche| seen.insert(niche.clone()))
            .collect();
        Self {
            niches,
            cities: neighbour_cities,
        }
    }

    pub fn niches(&self) -> &[String] {
        &self.niches
    }
}

impl PairSource for BestOpportunityPairs {
    fn pairs(&self) -> Vec<CityNiche> {
        StaticPairs::new(self.cities.clone(), self.niches.clone()).pairs()
    }
}

fn dedup_pairs(pairs: Vec<CityNiche>) -> Vec<CityNiche> {
    let mut seen = HashSet::new();
    pairs.into_iter().filter(|p| seen.insert(p.clone())).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairMode {
    Configured,
    FromBest,
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("a run is already in progress")]
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs_attempted: usize,
    pub pairs_skipped: usize,
    pub pairs_failed: usize,
    pub pairs_empty: usize,
    pub records_acquired: usize,
    pub new_metric_rows: usize,
    pub total_metric_rows: usize,
    pub mean_score: Option<f64>,
    pub max_score: Option<f64>,
    pub high_count: usize,
    pub best_pair: Option<CityNiche>,
    pub cancelled: bool,
}

#[derive(Debug)]
enum PairResult {
    Skipped,
    Cancelled,
    Acquired {
        records: usize,
        metric: Option<OpportunityMetric>,
        complete: bool,
    },
}

/// Iterates pairs through gate, acquisition, scoring and consolidation.
pub struct RunController {
    config: RunConfig,
    orchestrator: AcquisitionOrchestrator,
    gate: FreshnessGate,
    store: Mutex<ConsolidationStore>,
    ledger: Mutex<CacheLedger>,
    run_guard: Mutex<()>,
}

impl RunController {
    pub fn new(
        config: RunConfig,
        orchestrator: AcquisitionOrchestrator,
        store: ConsolidationStore,
        ledger: CacheLedger,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            gate: FreshnessGate::new(config.cache_ttl_days),
            config,
            orchestrator,
            store: Mutex::new(store),
            ledger: Mutex::new(ledger),
            run_guard: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn store(&self) -> &Mutex<ConsolidationStore> {
        &self.store
    }

    pub async fn pairs_for(&self, mode: PairMode) -> Vec<CityNiche> {
        match mode {
            PairMode::Configured => StaticPairs::from_config(&self.config).pairs(),
            PairMode::FromBest => {
                let store = self.store.lock().await;
                BestOpportunityPairs::from_metrics(
                    store.metrics(),
                    self.config.best_score_threshold,
                    self.config.neighbour_cities.clone(),
                )
                .pairs()
            }
        }
    }

    /// Runs every pair once. Overlapping calls are rejected with [`RunError::AlreadyRunning`].
    pub async fn run(
        &self,
        pairs: Vec<CityNiche>,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, RunError> {
        let Ok(_guard) = self.run_guard.try_lock() else {
            return Err(RunError::AlreadyRunning);
        };
        let pairs = dedup_pairs(pairs);
        if pairs.is_empty() {
            return Err(ConfigError::EmptyPairs.into());
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run", %run_id);
        info!(parent: &span, pairs = pairs.len(), concurrency = self.config.concurrency, "run started");

        let results = stream::iter(pairs.clone())
            .map(|key| async move {
                let result = self.process_pair(&key, cancel).await;
                result.map(|r| (key, r))
            })
            .buffer_unordered(self.config.concurrency)
            .try_collect::<Vec<_>>()
            .instrument(span.clone())
            .await?;

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            pairs_attempted: 0,
            pairs_skipped: 0,
            pairs_failed: 0,
            pairs_empty: 0,
            records_acquired: 0,
            new_metric_rows: 0,
            total_metric_rows: 0,
            mean_score: None,
            max_score: None,
            high_count: 0,
            best_pair: None,
            cancelled: cancel.is_cancelled(),
        };
        let mut new_metrics = Vec::new();
        for (_, result) in results {
            match result {
                PairResult::Skipped => summary.pairs_skipped += 1,
                PairResult::Cancelled => {}
                PairResult::Acquired {
                    records,
                    metric,
                    complete,
                } => {
                    summary.pairs_attempted += 1;
                    summary.records_acquired += records;
                    if !complete {
                        summary.pairs_failed += 1;
                    } else if records == 0 {
                        summary.pairs_empty += 1;
                    }
                    new_metrics.extend(metric);
                }
            }
        }

        summary.new_metric_rows = new_metrics.len();
        if !new_metrics.is_empty() {
            let n = new_metrics.len() as f64;
            summary.mean_score = Some(new_metrics.iter().map(|m| m.score).sum::<f64>() / n);
            summary.max_score = new_metrics.iter().map(|m| m.score).reduce(f64::max);
            summary.high_count = new_metrics
                .iter()
                .filter(|m| m.classification == Classification::High)
                .count();
            summary.best_pair = new_metrics
                .iter()
                .max_by(|a, b| a.score.total_cmp(&b.score))
                .map(OpportunityMetric::key);
        }

        let store = self.store.lock().await;
        summary.total_metric_rows = store.metrics().len();
        summary.finished_at = Utc::now();
        let entry = RunHistoryEntry {
            run_id,
            timestamp: summary.finished_at,
            cities: new_metrics.iter().map(|m| m.city.clone()).collect::<BTreeSet<_>>(),
            niches: new_metrics.iter().map(|m| m.niche.clone()).collect::<BTreeSet<_>>(),
            new_metric_rows: summary.new_metric_rows,
            total_rows: summary.total_metric_rows,
        };
        store.append_run_history(&entry).await?;
        drop(store);

        info!(
            parent: &span,
            attempted = summary.pairs_attempted,
            skipped = summary.pairs_skipped,
            failed = summary.pairs_failed,
            empty = summary.pairs_empty,
            records = summary.records_acquired,
            new_metrics = summary.new_metric_rows,
            total_metrics = summary.total_metric_rows,
            mean_score = ?summary.mean_score,
            max_score = ?summary.max_score,
            high = summary.high_count,
            cancelled = summary.cancelled,
            "run finished"
        );
        Ok(summary)
    }

    async fn process_pair(
        &self,
        key: &CityNiche,
        cancel: &CancellationToken,
    ) -> Result<PairResult, StoreError> {
        if cancel.is_cancelled() {
            return Ok(PairResult::Cancelled);
        }

        let decision = {
            let ledger = self.ledger.lock().await;
            self.gate.decide(&ledger, key, Utc::now())
        };
        if let GateDecision::Skip { last_success_at } = decision {
            info!(pair = %key, %last_success_at, "cache fresh; skipping");
            return Ok(PairResult::Skipped);
        }

        let span = info_span!("pair", pair = %key);
        let outcome = match self.orchestrator.acquire(key, cancel).instrument(span).await {
            Ok(outcome) => outcome,
            Err(AcquisitionError::Cancelled) => {
                info!(pair = %key, "acquisition cancelled; nothing merged");
                return Ok(PairResult::Cancelled);
            }
        };
        if cancel.is_cancelled() {
            return Ok(PairResult::Cancelled);
        }

        let complete = outcome.is_complete();
        let records = outcome.records.len();
        let metric = build_metric(key, &outcome.records, &self.config.scoring, Utc::now());

        {
            let mut store = self.store.lock().await;
            if records > 0 {
                store.merge_raw(outcome.records).await?;
            }
            if let Some(metric) = &metric {
                store.merge_metrics(vec![metric.clone()]).await?;
            }
        }

        if complete {
            self.ledger.lock().await.record_success(key, Utc::now()).await?;
        } else {
            warn!(pair = %key, records, "no channel completed; cache not refreshed");
        }

        Ok(PairResult::Acquired {
            records,
            metric,
            complete,
        })
    }
}

/// Builds the configured channels in priority order.
pub fn build_channels(
    config: &RunConfig,
    sync: &SyncConfig,
) -> Result<Vec<Arc<dyn RetrievalChannel>>> {
    let http = Arc::new(HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(sync.http_timeout_secs),
        user_agent: Some(sync.user_agent.clone()),
        global_concurrency: config.concurrency.max(1),
        ..Default::default()
    })?);

    let mut channels: Vec<Arc<dyn RetrievalChannel>> = Vec::with_capacity(config.channels.len());
    for spec in &config.channels {
        match (spec.kind.as_str(), spec.path.as_ref()) {
            (CHANNEL_SERPAPI, _) => {
                let api_key = sync
                    .serpapi_api_key
                    .clone()
                    .ok_or(ConfigError::MissingApiKey)?;
                channels.push(Arc::new(SerpApiChannel::new(Arc::clone(&http), api_key)));
            }
            (CHANNEL_FIXTURE_INTERACTIVE, Some(path)) => {
                let driver = FixtureSurfaceDriver::load(path)?;
                let extractor =
                    CardExtractor::google_maps().context("building card extractor")?;
                channels.push(Arc::new(InteractiveChannel::new(Arc::new(driver), extractor)));
            }
            (CHANNEL_FIXTURE_INTERACTIVE, None) => {
                return Err(ConfigError::MissingChannelPath(spec.kind.clone()).into());
            }
            (other, _) => return Err(ConfigError::UnknownChannel(other.to_string()).into()),
        }
    }
    Ok(channels)
}

pub async fn build_controller(sync: &SyncConfig, config: RunConfig) -> Result<RunController> {
    config.validate()?;
    let channels = build_channels(&config, sync)?;
    let orchestrator = AcquisitionOrchestrator::new(channels, config.acquisition_policy());
    let store = ConsolidationStore::open(&sync.data_dir)
        .await
        .with_context(|| format!("opening store at {}", sync.data_dir.display()))?;
    let ledger = CacheLedger::open(&sync.data_dir)
        .await
        .with_context(|| format!("opening cache ledger at {}", sync.data_dir.display()))?;
    Ok(RunController::new(config, orchestrator, store, ledger)?)
}

/// Exports snapshots of the controller's current store.
pub async fn export_current(controller: &RunController, data_dir: &Path, run_id: Uuid) -> Result<PathBuf> {
    let store = controller.store().lock().await;
    export_snapshots(
        data_dir,
        run_id,
        store.metrics(),
        store.raw_records(),
        controller.config().best_score_threshold,
    )
}

pub async fn run_sync_once_from_env(
    mode: PairMode,
    export: bool,
    cancel: &CancellationToken,
) -> Result<RunSummary> {
    let sync = SyncConfig::from_env();
    let config = RunConfig::load(&sync.config_path)?;
    let controller = build_controller(&sync, config).await?;
    let pairs = controller.pairs_for(mode).await;
    let summary = controller.run(pairs, cancel).await?;
    if export && !summary.cancelled {
        export_current(&controller, &sync.data_dir, summary.run_id).await?;
    }
    Ok(summary)
}

/// Cron-driven re-runs; a tick that lands while a run is in progress is skipped.
pub async fn maybe_build_scheduler(
    controller: Arc<RunController>,
    sync: &SyncConfig,
    mode: PairMode,
    cancel: CancellationToken,
) -> Result<Option<JobScheduler>> {
    if !sync.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let data_dir = sync.data_dir.clone();
    let job = Job::new_async(sync.sync_cron.as_str(), move |_uuid, _l| {
        let controller = Arc::clone(&controller);
        let cancel = cancel.clone();
        let data_dir = data_dir.clone();
        Box::pin(async move {
            let pairs = controller.pairs_for(mode).await;
            match controller.run(pairs, &cancel).await {
                Ok(summary) => {
                    if let Err(err) = export_current(&controller, &data_dir, summary.run_id).await {
                        error!(error = %err, "snapshot export failed");
                    }
                }
                Err(RunError::AlreadyRunning) => {
                    info!("previous run still in progress; skipping scheduled tick");
                }
                Err(err) => error!(error = %err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", sync.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::tests::{names, page, quiet_policy, ScriptedChannel};
    use chrono::TimeZone;
    use lbof_adapters::{ChannelError, ChannelPage, ChannelShape};
    use lbof_core::SourceChannel;
    use tempfile::tempdir;

    fn config(cities: &[&str], niches: &[&str]) -> RunConfig {
        RunConfig {
            cities: cities.iter().map(|c| c.to_string()).collect(),
            niches: niches.iter().map(|n| n.to_string()).collect(),
            concurrency: 2,
            ..RunConfig::default()
        }
    }

    async fn controller(
        dir: &Path,
        config: RunConfig,
        channels: Vec<Arc<dyn RetrievalChannel>>,
    ) -> RunController {
        let orchestrator = AcquisitionOrchestrator::new(channels, quiet_policy());
        let store = ConsolidationStore::open(dir).await.expect("store");
        let ledger = CacheLedger::open(dir).await.expect("ledger");
        RunController::new(config, orchestrator, store, ledger).expect("controller")
    }

    fn bounded(script: Vec<Result<ChannelPage, ChannelError>>) -> Arc<ScriptedChannel> {
        Arc::new(ScriptedChannel::new(
            SourceChannel::SerpApi,
            ChannelShape::Bounded { page_size: 20 },
            script,
        ))
    }

    #[test]
    fn static_pairs_are_city_major_and_deduplicated() {
        let pairs = StaticPairs::new(
            vec!["A".into(), "B".into(), "A".into()],
            vec!["x".into(), "y".into()],
        )
        .pairs();
        let rendered = pairs.iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(rendered, vec!["A / x", "A / y", "B / x", "B / y"]);
    }

    #[test]
    fn best_pairs_cross_best_niches_with_neighbours() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap();
        let metric = |city: &str, niche: &str, score: f64| OpportunityMetric {
            city: city.into(),
            niche: niche.into(),
            company_count: 2,
            avg_rating: None,
            total_reviews: 0,
            pct_low_quality: 0.0,
            pct_no_reviews: 100.0,
            score,
            classification: Classification::High,
            computed_at: at,
        };
        let metrics = vec![
            metric("A", "x", 0.9),
            metric("B", "x", 0.8),
            metric("A", "y", 0.7),
            metric("A", "z", 0.5),
        ];
        let source = BestOpportunityPairs::from_metrics(&metrics, 0.63, vec!["N1".into(), "N2".into()]);
        assert_eq!(source.niches(), ["x".to_string(), "y".to_string()]);
        let rendered = source.pairs().iter().map(ToString::to_string).collect::<Vec<_>>();
        assert_eq!(rendered, vec!["N1 / x", "N1 / y", "N2 / x", "N2 / y"]);
    }

    #[test]
    fn config_yaml_uses_camel_case_and_defaults() {
        let yaml = r#"
cities: [Contagem, Betim]
niches: [pet shop]
demandWeight: 0.5
cacheTtlDays: 7
maxRetries: 4
politenessDelayMs: { min: 0, max: 0 }
channels:
  - kind: serpapi
  - kind: fixture-interactive
    path: fixtures/surfaces.json
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.scoring.demand_weight, 0.5);
        assert_eq!(config.scoring.competition_weight, 0.3);
        assert_eq!(config.cache_ttl_days, 7);
        assert_eq!(config.max_retries, Some(4));
        assert_eq!(config.stall_polls, 20);
        assert_eq!(config.best_score_threshold, 0.63);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.acquisition_policy().max_attempts, Some(4));
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let base = config(&["A"], &["x"]);

        let mut c = base.clone();
        c.scoring.demand_weight = -0.1;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidWeight { name: "demandWeight", .. })));

        let mut c = base.clone();
        c.scoring.satisfaction_weight = f64::NAN;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidWeight { .. })));

        let mut c = base.clone();
        c.scoring.medium_threshold = 0.8;
        assert!(matches!(c.validate(), Err(ConfigError::InvalidThresholds { .. })));

        let mut c = base.clone();
        c.max_retries = Some(0);
        assert!(matches!(c.validate(), Err(ConfigError::Zero("maxRetries"))));

        let mut c = base.clone();
        c.concurrency = 0;
        assert!(matches!(c.validate(), Err(ConfigError::Zero("concurrency"))));

        let mut c = base.clone();
        c.channels = vec![ChannelSpec {
            kind: "carrier-pigeon".into(),
            path: None,
        }];
        assert!(matches!(c.validate(), Err(ConfigError::UnknownChannel(_))));

        let mut c = base;
        c.channels = vec![ChannelSpec {
            kind: CHANNEL_FIXTURE_INTERACTIVE.into(),
            path: None,
        }];
        assert!(matches!(c.validate(), Err(ConfigError::MissingChannelPath(_))));
    }

    #[tokio::test]
    async fn empty_pair_list_is_a_config_error() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![]);
        let ctl = controller(dir.path(), config(&[], &["x"]), vec![channel.clone()]).await;
        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let err = ctl.run(pairs, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Config(ConfigError::EmptyPairs)));
        assert_eq!(channel.calls(), 0);
    }

    #[tokio::test]
    async fn run_merges_scores_and_records_history() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![Ok(page(&["Empresa1", "Empresa2"], None))]);
        let ctl = controller(dir.path(), config(&["Contagem"], &["pet shop"]), vec![channel]).await;

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let summary = ctl.run(pairs, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.pairs_attempted, 1);
        assert_eq!(summary.records_acquired, 2);
        assert_eq!(summary.new_metric_rows, 1);
        assert_eq!(summary.total_metric_rows, 1);
        assert_eq!(summary.best_pair, Some(CityNiche::new("Contagem", "pet shop")));
        assert!(!summary.cancelled);

        let store = ctl.store().lock().await;
        assert_eq!(store.raw_records().len(), 2);
        let metric = &store.metrics()[0];
        assert_eq!(metric.company_count, 2);
        let history = store.run_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].run_id, summary.run_id);
        assert!(history[0].cities.contains("Contagem"));
    }

    #[tokio::test]
    async fn concurrent_pairs_merge_once_per_key() {
        let dir = tempdir().expect("tempdir");
        let script = (0..4)
            .map(|_| Ok(page(&["Empresa1", "Empresa2"], None)))
            .collect::<Vec<_>>();
        let channel = bounded(script);
        let config = RunConfig {
            cache_ttl_days: 0,
            ..config(&["Contagem", "Betim"], &["pet shop"])
        };
        let ctl = controller(dir.path(), config, vec![channel.clone()]).await;
        let contagem = CityNiche::new("Contagem", "pet shop");
        let betim = CityNiche::new("Betim", "pet shop");
        let pairs = vec![contagem.clone(), betim.clone(), contagem.clone()];

        let first = ctl.run(pairs.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(channel.calls(), 2);
        assert_eq!(first.pairs_attempted, 2);
        {
            let store = ctl.store().lock().await;
            assert_eq!(store.metrics().len(), 2);
            assert_eq!(store.raw_records().len(), 4);
        }

        let second = ctl.run(pairs, &CancellationToken::new()).await.unwrap();
        assert_eq!(channel.calls(), 4);
        assert_eq!(second.total_metric_rows, 2);
        let store = ctl.store().lock().await;
        assert_eq!(store.metrics().len(), 2);
        assert_eq!(store.raw_records().len(), 4);
        assert!(store.metric_for(&contagem).is_some());
        assert!(store.metric_for(&betim).is_some());

        let reopened = ConsolidationStore::open(dir.path()).await.unwrap();
        assert_eq!(reopened.metrics().len(), 2);
        assert_eq!(reopened.raw_records().len(), 4);
    }

    #[tokio::test]
    async fn fresh_cache_skips_acquisition_on_rerun() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![Ok(page(&["Empresa1"], None))]);
        let ctl = controller(
            dir.path(),
            config(&["Contagem"], &["pet shop"]),
            vec![channel.clone()],
        )
        .await;

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        ctl.run(pairs.clone(), &CancellationToken::new()).await.unwrap();
        assert_eq!(channel.calls(), 1);
        let before = ctl.store().lock().await.metrics().to_vec();

        let summary = ctl.run(pairs, &CancellationToken::new()).await.unwrap();
        assert_eq!(channel.calls(), 1);
        assert_eq!(summary.pairs_skipped, 1);
        assert_eq!(summary.pairs_attempted, 0);
        assert_eq!(ctl.store().lock().await.metrics(), before.as_slice());
    }

    #[tokio::test]
    async fn failed_pair_merges_partial_records_but_not_cache() {
        let dir = tempdir().expect("tempdir");
        let first = names("E", 20);
        let refs = first.iter().map(String::as_str).collect::<Vec<_>>();
        let channel = bounded(vec![
            Ok(page(&refs, Some("20"))),
            Err(ChannelError::Transient("503".into())),
            Err(ChannelError::Transient("503".into())),
            Err(ChannelError::Transient("503".into())),
        ]);
        let ctl = controller(
            dir.path(),
            config(&["Contagem"], &["pet shop"]),
            vec![channel.clone()],
        )
        .await;

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let summary = ctl.run(pairs, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.pairs_failed, 1);
        assert_eq!(summary.records_acquired, 20);

        let ledger = CacheLedger::open(dir.path()).await.unwrap();
        assert_eq!(ledger.last_success(&CityNiche::new("Contagem", "pet shop")), None);
    }

    #[tokio::test]
    async fn empty_result_is_cached_without_metric() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![Ok(ChannelPage::empty_end())]);
        let ctl = controller(dir.path(), config(&["Contagem"], &["padaria"]), vec![channel]).await;

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let summary = ctl.run(pairs, &CancellationToken::new()).await.unwrap();
        assert_eq!(summary.pairs_empty, 1);
        assert_eq!(summary.new_metric_rows, 0);
        assert!(ctl.store().lock().await.metrics().is_empty());

        let ledger = CacheLedger::open(dir.path()).await.unwrap();
        assert!(ledger.last_success(&CityNiche::new("Contagem", "padaria")).is_some());
    }

    #[tokio::test]
    async fn cancelled_run_leaves_store_and_cache_untouched() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![Ok(page(&["Empresa1"], None))]);
        let ctl = controller(
            dir.path(),
            config(&["Contagem", "Betim"], &["pet shop"]),
            vec![channel.clone()],
        )
        .await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let summary = ctl.run(pairs, &cancel).await.unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.pairs_attempted, 0);
        assert_eq!(channel.calls(), 0);
        assert!(ctl.store().lock().await.raw_records().is_empty());
        assert!(CacheLedger::open(dir.path()).await.unwrap().entries().is_empty());
    }

    #[tokio::test]
    async fn persistence_failure_aborts_the_run() {
        let dir = tempdir().expect("tempdir");
        let channel = bounded(vec![Ok(page(&["Empresa1"], None))]);
        let ctl = controller(dir.path(), config(&["Contagem"], &["pet shop"]), vec![channel]).await;
        std::fs::create_dir(dir.path().join(lbof_storage::RAW_RECORDS_FILE)).unwrap();

        let pairs = ctl.pairs_for(PairMode::Configured).await;
        let err = ctl.run(pairs, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Persistence(_)));
        assert!(ctl.store().lock().await.metrics().is_empty());
    }

    #[tokio::test]
    async fn overlapping_runs_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let ctl = controller(dir.path(), config(&["A"], &["x"]), vec![bounded(vec![])]).await;
        let _held = ctl.run_guard.lock().await;
        let err = ctl
            .run(vec![CityNiche::new("A", "x")], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning));
    }
}
