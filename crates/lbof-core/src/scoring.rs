//! Aggregation, opportunity score and tier classification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CityNiche, Classification, OpportunityMetric, RawBusinessRecord};

/// Reviews at which demand saturates.
pub const DEMAND_SATURATION_REVIEWS: f64 = 50.0;
/// Companies at which competition saturates.
pub const COMPETITION_SATURATION_COMPANIES: f64 = 20.0;
pub const MAX_RATING: f64 = 5.0;
/// Ratings below this count as low quality.
pub const LOW_QUALITY_RATING: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConfig {
    pub demand_weight: f64,
    pub competition_weight: f64,
    pub satisfaction_weight: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            demand_weight: 0.4,
            competition_weight: 0.3,
            satisfaction_weight: 0.3,
            high_threshold: 0.66,
            medium_threshold: 0.40,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aggregates {
    pub company_count: u64,
    pub avg_rating: Option<f64>,
    pub total_reviews: u64,
    pub pct_low_quality: f64,
    pub pct_no_reviews: f64,
}

/// Folds one pair's records into aggregates. `None` for an empty batch.
///
/// A rating of 0 means "unrated" and is excluded from the average. Missing and zero
/// review counts both count as "no reviews".
pub fn aggregate(records: &[RawBusinessRecord]) -> Option<Aggregates> {
    if records.is_empty() {
        return None;
    }
    let company_count = records.len() as u64;
    let rated = records
        .iter()
        .map(|r| r.rating)
        .filter(|rating| *rating > 0.0)
        .collect::<Vec<_>>();
    let avg_rating = if rated.is_empty() {
        None
    } else {
        Some(rated.iter().sum::<f64>() / rated.len() as f64)
    };
    let low_quality = rated.iter().filter(|r| **r < LOW_QUALITY_RATING).count();
    let no_reviews = records.iter().filter(|r| r.review_count == 0).count();

    Some(Aggregates {
        company_count,
        avg_rating,
        total_reviews: records.iter().map(|r| r.review_count).sum(),
        pct_low_quality: low_quality as f64 / company_count as f64 * 100.0,
        pct_no_reviews: no_reviews as f64 / company_count as f64 * 100.0,
    })
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Weighted demand/competition/dissatisfaction blend, clamped to [0, 1] and rounded.
///
/// An unknown average rating is scored as 0, which maximizes the dissatisfaction term.
pub fn score(aggregates: &Aggregates, config: &ScoringConfig) -> f64 {
    let demand = (aggregates.total_reviews as f64 / DEMAND_SATURATION_REVIEWS).min(1.0);
    let competition =
        1.0 - (aggregates.company_count as f64 / COMPETITION_SATURATION_COMPANIES).min(1.0);
    let inverse_satisfaction = (MAX_RATING - aggregates.avg_rating.unwrap_or(0.0)) / MAX_RATING;

    let raw = demand * config.demand_weight
        + competition * config.competition_weight
        + inverse_satisfaction * config.satisfaction_weight;
    round3(raw.clamp(0.0, 1.0))
}

pub fn classify(score: f64, config: &ScoringConfig) -> Classification {
    if score >= config.high_threshold {
        Classification::High
    } else if score >= config.medium_threshold {
        Classification::Medium
    } else {
        Classification::Low
    }
}

/// Builds the metric row for one pair, or `None` when no companies were found.
pub fn build_metric(
    key: &CityNiche,
    records: &[RawBusinessRecord],
    config: &ScoringConfig,
    computed_at: DateTime<Utc>,
) -> Option<OpportunityMetric> {
    let aggregates = aggregate(records)?;
    let score = score(&aggregates, config);
    Some(OpportunityMetric {
        city: key.city.clone(),
        niche: key.niche.clone(),
        company_count: aggregates.company_count,
        avg_rating: aggregates.avg_rating,
        total_reviews: aggregates.total_reviews,
        pct_low_quality: aggregates.pct_low_quality,
        pct_no_reviews: aggregates.pct_no_reviews,
        score,
        classification: classify(score, config),
        computed_at,
    })
}
