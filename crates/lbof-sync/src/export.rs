//! Ranked views over the metric store and Parquet snapshot export.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use lbof_core::{Classification, OpportunityMetric, RawBusinessRecord};
use lbof_storage::{rank_metrics, ConsolidationStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

/// Rows scoring strictly above `threshold`, best first.
pub fn best_opportunities(metrics: &[OpportunityMetric], threshold: f64) -> Vec<OpportunityMetric> {
    let mut best = metrics
        .iter()
        .filter(|m| m.score > threshold)
        .cloned()
        .collect::<Vec<_>>();
    rank_metrics(&mut best);
    best
}

/// Businesses found for one best-scoring niche, across every city it was searched in.
#[derive(Debug, Clone, PartialEq)]
pub struct NicheCompanies {
    pub niche: String,
    pub companies: Vec<RawBusinessRecord>,
}

/// Groups raw records under each niche that has a metric above `threshold`.
///
/// Niches follow best-opportunity rank. Within a niche, companies keep store order and a
/// repeated (name, address, city) is kept once.
pub fn niche_companies(
    metrics: &[OpportunityMetric],
    raw: &[RawBusinessRecord],
    threshold: f64,
) -> Vec<NicheCompanies> {
    let mut niches = Vec::new();
    for metric in best_opportunities(metrics, threshold) {
        if !niches.contains(&metric.niche) {
            niches.push(metric.niche);
        }
    }

    niches
        .into_iter()
        .map(|niche| {
            let mut seen = BTreeSet::new();
            let companies = raw
                .iter()
                .filter(|r| r.niche == niche)
                .filter(|r| seen.insert((r.name.as_str(), r.address.as_deref(), r.city.as_str())))
                .cloned()
                .collect();
            NicheCompanies { niche, companies }
        })
        .collect()
}

/// File stem for a niche: alphanumerics kept, whitespace runs become `_`.
pub fn niche_file_stem(niche: &str) -> String {
    let stem = niche
        .split_whitespace()
        .map(|word| word.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    if stem.is_empty() {
        "niche".to_string()
    } else {
        stem
    }
}

/// Writes one `<niche>_companies.parquet` per best niche under `out_dir`.
pub fn export_niche_companies(
    store: &ConsolidationStore,
    out_dir: &Path,
    threshold: f64,
) -> Result<Vec<SnapshotFile>> {
    write_niche_companies(out_dir, out_dir, store.metrics(), store.raw_records(), threshold)
}

fn write_niche_companies(
    manifest_root: &Path,
    out_dir: &Path,
    metrics: &[OpportunityMetric],
    raw: &[RawBusinessRecord],
    threshold: f64,
) -> Result<Vec<SnapshotFile>> {
    std::fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let mut files = Vec::new();
    for group in niche_companies(metrics, raw, threshold) {
        if group.companies.is_empty() {
            info!(niche = %group.niche, "no stored companies for best niche");
            continue;
        }
        let stem = niche_file_stem(&group.niche);
        let path = out_dir.join(format!("{stem}_companies.parquet"));
        write_raw_parquet(&path, &group.companies)?;
        files.push(manifest_entry(
            &format!("companies:{}", group.niche),
            group.companies.len(),
            manifest_root,
            &path,
        )?);
    }
    Ok(files)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NicheComparison {
    pub niche: String,
    pub cities: usize,
    pub mean_score: f64,
    pub std_dev: f64,
    pub replicability_pct: f64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// How consistently each niche scores across the cities it was analysed in.
pub fn compare_niches(metrics: &[OpportunityMetric]) -> Vec<NicheComparison> {
    let mut by_niche: BTreeMap<&str, Vec<&OpportunityMetric>> = BTreeMap::new();
    for metric in metrics {
        by_niche.entry(metric.niche.as_str()).or_default().push(metric);
    }

    let mut rows = by_niche
        .into_iter()
        .map(|(niche, rows)| {
            let cities = rows.iter().map(|m| m.city.as_str()).collect::<BTreeSet<_>>().len();
            let n = rows.len() as f64;
            let mean = rows.iter().map(|m| m.score).sum::<f64>() / n;
            let std_dev = if rows.len() > 1 {
                let var = rows.iter().map(|m| (m.score - mean).powi(2)).sum::<f64>() / (n - 1.0);
                var.sqrt()
            } else {
                0.0
            };
            let high = rows
                .iter()
                .filter(|m| m.classification == Classification::High)
                .count();
            NicheComparison {
                niche: niche.to_string(),
                cities,
                mean_score: round2(mean),
                std_dev: round2(std_dev),
                replicability_pct: round2(high as f64 / n * 100.0),
            }
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.mean_score
            .total_cmp(&a.mean_score)
            .then_with(|| a.niche.cmp(&b.niche))
    });
    rows
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Writes every snapshot table under `<data_dir>/snapshots/<run_id>/` and returns the
/// manifest path.
pub fn export_snapshots(
    data_dir: &Path,
    run_id: Uuid,
    metrics: &[OpportunityMetric],
    raw: &[RawBusinessRecord],
    best_threshold: f64,
) -> Result<PathBuf> {
    let snapshot_dir = data_dir.join("snapshots").join(run_id.to_string());
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let best = best_opportunities(metrics, best_threshold);
    let comparison = compare_niches(metrics);

    let metrics_path = snapshot_dir.join("metrics.parquet");
    let best_path = snapshot_dir.join("best_opportunities.parquet");
    let comparison_path = snapshot_dir.join("niche_comparison.parquet");
    let raw_path = snapshot_dir.join("raw_records.parquet");

    write_metrics_parquet(&metrics_path, metrics)?;
    write_metrics_parquet(&best_path, &best)?;
    write_comparison_parquet(&comparison_path, &comparison)?;
    write_raw_parquet(&raw_path, raw)?;

    let mut files = vec![
        manifest_entry("metrics", metrics.len(), &snapshot_dir, &metrics_path)?,
        manifest_entry("best_opportunities", best.len(), &snapshot_dir, &best_path)?,
        manifest_entry("niche_comparison", comparison.len(), &snapshot_dir, &comparison_path)?,
        manifest_entry("raw_records", raw.len(), &snapshot_dir, &raw_path)?,
    ];
    files.extend(write_niche_companies(
        &snapshot_dir,
        &snapshot_dir.join("niches"),
        metrics,
        raw,
        best_threshold,
    )?);

    let manifest = SnapshotManifest {
        schema_version: 1,
        run_id,
        generated_at: Utc::now(),
        files,
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    info!(%run_id, path = %manifest_path.display(), "exported parquet snapshots");
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_metrics_parquet(path: &Path, metrics: &[OpportunityMetric]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("niche", DataType::Utf8, false),
        ArrowField::new("company_count", DataType::UInt64, false),
        ArrowField::new("avg_rating", DataType::Float64, true),
        ArrowField::new("total_reviews", DataType::UInt64, false),
        ArrowField::new("pct_low_quality", DataType::Float64, false),
        ArrowField::new("pct_no_reviews", DataType::Float64, false),
        ArrowField::new("score", DataType::Float64, false),
        ArrowField::new("classification", DataType::Utf8, false),
        ArrowField::new("computed_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(metrics.iter().map(|m| m.city.as_str()))),
            Arc::new(StringArray::from_iter_values(metrics.iter().map(|m| m.niche.as_str()))),
            Arc::new(UInt64Array::from_iter_values(metrics.iter().map(|m| m.company_count))),
            Arc::new(Float64Array::from(
                metrics.iter().map(|m| m.avg_rating).collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from_iter_values(metrics.iter().map(|m| m.total_reviews))),
            Arc::new(Float64Array::from_iter_values(metrics.iter().map(|m| m.pct_low_quality))),
            Arc::new(Float64Array::from_iter_values(metrics.iter().map(|m| m.pct_no_reviews))),
            Arc::new(Float64Array::from_iter_values(metrics.iter().map(|m| m.score))),
            Arc::new(StringArray::from_iter_values(
                metrics.iter().map(|m| m.classification.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                metrics.iter().map(|m| m.computed_at.to_rfc3339()),
            )),
        ],
    )
    .context("building metrics record batch")?;
    write_parquet(path, batch)
}

fn write_comparison_parquet(path: &Path, rows: &[NicheComparison]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("niche", DataType::Utf8, false),
        ArrowField::new("cities", DataType::UInt64, false),
        ArrowField::new("mean_score", DataType::Float64, false),
        ArrowField::new("std_dev", DataType::Float64, false),
        ArrowField::new("replicability_pct", DataType::Float64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.niche.as_str()))),
            Arc::new(UInt64Array::from_iter_values(rows.iter().map(|r| r.cities as u64))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.mean_score))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.std_dev))),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.replicability_pct))),
        ],
    )
    .context("building niche comparison record batch")?;
    write_parquet(path, batch)
}

fn write_raw_parquet(path: &Path, raw: &[RawBusinessRecord]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("fingerprint", DataType::Utf8, false),
        ArrowField::new("niche", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("address", DataType::Utf8, true),
        ArrowField::new("phone", DataType::Utf8, true),
        ArrowField::new("website", DataType::Utf8, true),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("rating", DataType::Float64, false),
        ArrowField::new("review_count", DataType::UInt64, false),
        ArrowField::new("latitude", DataType::Float64, true),
        ArrowField::new("longitude", DataType::Float64, true),
        ArrowField::new("source_channel", DataType::Utf8, false),
        ArrowField::new("discovered_at", DataType::Utf8, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from_iter_values(raw.iter().map(|r| r.fingerprint.as_str()))),
            Arc::new(StringArray::from_iter_values(raw.iter().map(|r| r.niche.as_str()))),
            Arc::new(StringArray::from_iter_values(raw.iter().map(|r| r.city.as_str()))),
            Arc::new(StringArray::from_iter_values(raw.iter().map(|r| r.name.as_str()))),
            Arc::new(optional_strings(raw, |r| r.address.as_deref())),
            Arc::new(optional_strings(raw, |r| r.phone.as_deref())),
            Arc::new(optional_strings(raw, |r| r.website.as_deref())),
            Arc::new(optional_strings(raw, |r| r.category.as_deref())),
            Arc::new(Float64Array::from_iter_values(raw.iter().map(|r| r.rating))),
            Arc::new(UInt64Array::from_iter_values(raw.iter().map(|r| r.review_count))),
            Arc::new(Float64Array::from(raw.iter().map(|r| r.latitude).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(raw.iter().map(|r| r.longitude).collect::<Vec<_>>())),
            Arc::new(StringArray::from_iter_values(
                raw.iter().map(|r| r.source_channel.as_str()),
            )),
            Arc::new(StringArray::from_iter_values(
                raw.iter().map(|r| r.discovered_at.to_rfc3339()),
            )),
        ],
    )
    .context("building raw records record batch")?;
    write_parquet(path, batch)
}

fn optional_strings<'a>(
    raw: &'a [RawBusinessRecord],
    field: impl Fn(&'a RawBusinessRecord) -> Option<&'a str>,
) -> StringArray {
    StringArray::from(raw.iter().map(field).collect::<Vec<_>>())
}

fn manifest_entry(name: &str, rows: usize, snapshot_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path
        .strip_prefix(snapshot_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
        rows,
    })
}
