//! Durable consolidation store, freshness ledger and run-history log for LBOF.
//!
//! Collections are persisted as JSON Lines. Every rewrite is computed in memory first and
//! then swapped in through a temp-file rename, so a failed write leaves the last committed
//! file in place.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lbof_core::{CacheEntry, CityNiche, OpportunityMetric, RawBusinessRecord, RunHistoryEntry};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub mod http;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse,
    HttpClientConfig, HttpFetcher, RetryDisposition,
};

pub const CRATE_NAME: &str = "lbof-storage";

pub const RAW_RECORDS_FILE: &str = "raw_records.jsonl";
pub const METRICS_FILE: &str = "metrics.jsonl";
pub const CACHE_FILE: &str = "cache.jsonl";
pub const RUN_HISTORY_FILE: &str = "run_history.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing {collection}: {source}")]
    Serialize {
        collection: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("parsing {} line {line}: {source}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    fn io<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(std::io::Error) -> Self + 'a {
        move |source| StoreError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    pub appended: usize,
    pub total: usize,
}

/// Appends `batch` and keeps the most recently appended row per (name, city, niche).
///
/// Surviving rows keep the relative order of their last occurrence.
pub fn merge_raw_collection(
    existing: &[RawBusinessRecord],
    batch: Vec<RawBusinessRecord>,
) -> Vec<RawBusinessRecord> {
    let mut seen = HashSet::new();
    let mut kept = existing
        .iter()
        .cloned()
        .chain(batch)
        .rev()
        .filter(|r| seen.insert((r.name.clone(), r.city.clone(), r.niche.clone())))
        .collect::<Vec<_>>();
    kept.reverse();
    kept
}

/// Appends `batch` and keeps the row with the latest `computed_at` per (city, niche).
///
/// Equal timestamps resolve to the later-appended row. Output is ranked by score,
/// highest first.
pub fn merge_metric_collection(
    existing: &[OpportunityMetric],
    batch: Vec<OpportunityMetric>,
) -> Vec<OpportunityMetric> {
    let mut latest: HashMap<CityNiche, OpportunityMetric> = HashMap::new();
    for metric in existing.iter().cloned().chain(batch) {
        match latest.get(&metric.key()) {
            Some(current) if current.computed_at > metric.computed_at => {}
            _ => {
                latest.insert(metric.key(), metric);
            }
        }
    }
    let mut rows = latest.into_values().collect::<Vec<_>>();
    rank_metrics(&mut rows);
    rows
}

pub fn rank_metrics(rows: &mut [OpportunityMetric]) {
    rows.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.city.cmp(&b.city))
            .then_with(|| a.niche.cmp(&b.niche))
    });
}

/// Owner of the persisted raw-record and metric collections.
#[derive(Debug)]
pub struct ConsolidationStore {
    root: PathBuf,
    raw: Vec<RawBusinessRecord>,
    metrics: Vec<OpportunityMetric>,
}

impl ConsolidationStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let raw = read_jsonl(&root.join(RAW_RECORDS_FILE)).await?;
        let metrics = read_jsonl(&root.join(METRICS_FILE)).await?;
        debug!(
            root = %root.display(),
            raw = raw.len(),
            metrics = metrics.len(),
            "opened consolidation store"
        );
        Ok(Self { root, raw, metrics })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_records(&self) -> &[RawBusinessRecord] {
        &self.raw
    }

    pub fn metrics(&self) -> &[OpportunityMetric] {
        &self.metrics
    }

    pub fn metric_for(&self, key: &CityNiche) -> Option<&OpportunityMetric> {
        self.metrics
            .iter()
            .find(|m| m.city == key.city && m.niche == key.niche)
    }

    pub async fn merge_raw(
        &mut self,
        batch: Vec<RawBusinessRecord>,
    ) -> Result<MergeOutcome, StoreError> {
        let appended = batch.len();
        let merged = merge_raw_collection(&self.raw, batch);
        write_jsonl(&self.root.join(RAW_RECORDS_FILE), "raw records", &merged).await?;
        self.raw = merged;
        Ok(MergeOutcome {
            appended,
            total: self.raw.len(),
        })
    }

    pub async fn merge_metrics(
        &mut self,
        batch: Vec<OpportunityMetric>,
    ) -> Result<MergeOutcome, StoreError> {
        let appended = batch.len();
        let merged = merge_metric_collection(&self.metrics, batch);
        write_jsonl(&self.root.join(METRICS_FILE), "metrics", &merged).await?;
        self.metrics = merged;
        Ok(MergeOutcome {
            appended,
            total: self.metrics.len(),
        })
    }

    pub async fn append_run_history(&self, entry: &RunHistoryEntry) -> Result<(), StoreError> {
        let path = self.root.join(RUN_HISTORY_FILE);
        let mut line = serde_json::to_vec(entry).map_err(|source| StoreError::Serialize {
            collection: "run history",
            source,
        })?;
        line.push(b'\n');

        fs::create_dir_all(&self.root)
            .await
            .map_err(StoreError::io("creating store directory", &self.root))?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(StoreError::io("opening run history", &path))?;
        file.write_all(&line)
            .await
            .map_err(StoreError::io("appending run history", &path))?;
        file.flush()
            .await
            .map_err(StoreError::io("flushing run history", &path))?;
        Ok(())
    }

    pub async fn run_history(&self) -> Result<Vec<RunHistoryEntry>, StoreError> {
        read_jsonl(&self.root.join(RUN_HISTORY_FILE)).await
    }
}

/// Persisted `lastSuccessAt` per (niche, city).
#[derive(Debug)]
pub struct CacheLedger {
    path: PathBuf,
    entries: BTreeMap<(String, String), DateTime<Utc>>,
}

impl CacheLedger {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = root.as_ref().join(CACHE_FILE);
        let rows: Vec<CacheEntry> = read_jsonl(&path).await?;
        let entries = rows
            .into_iter()
            .map(|e| ((e.niche, e.city), e.last_success_at))
            .collect();
        Ok(Self { path, entries })
    }

    pub fn last_success(&self, key: &CityNiche) -> Option<DateTime<Utc>> {
        self.entries
            .get(&(key.niche.clone(), key.city.clone()))
            .copied()
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries
            .iter()
            .map(|((niche, city), at)| CacheEntry {
                niche: niche.clone(),
                city: city.clone(),
                last_success_at: *at,
            })
            .collect()
    }

    pub async fn record_success(
        &mut self,
        key: &CityNiche,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut next = self.entries.clone();
        next.insert((key.niche.clone(), key.city.clone()), at);
        let rows = next
            .iter()
            .map(|((niche, city), at)| CacheEntry {
                niche: niche.clone(),
                city: city.clone(),
                last_success_at: *at,
            })
            .collect::<Vec<_>>();
        write_jsonl(&self.path, "cache entries", &rows).await?;
        self.entries = next;
        Ok(())
    }
}

async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
    if !fs::try_exists(path)
        .await
        .map_err(StoreError::io("checking", path))?
    {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .await
        .map_err(StoreError::io("reading", path))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}

async fn write_jsonl<T: Serialize>(
    path: &Path,
    collection: &'static str,
    rows: &[T],
) -> Result<(), StoreError> {
    let mut bytes = Vec::new();
    for row in rows {
        serde_json::to_writer(&mut bytes, row)
            .map_err(|source| StoreError::Serialize { collection, source })?;
        bytes.push(b'\n');
    }
    replace_atomically(path, &bytes).await
}

/// Writes `bytes` to a sibling temp file and renames it over `path`.
pub async fn replace_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(StoreError::io("creating store directory", parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(StoreError::io("opening temp file", &temp_path))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(source) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "writing temp file",
            path: temp_path,
            source,
        });
    }

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            action: "atomically replacing",
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
