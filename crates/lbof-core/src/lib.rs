//! Core domain model for LBOF: business records, opportunity metrics, cache and run history.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub mod fingerprint;
pub mod scoring;

pub const CRATE_NAME: &str = "lbof-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Which upstream surface produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    SerpApi,
    Interactive,
}

impl SourceChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceChannel::SerpApi => "serp_api",
            SourceChannel::Interactive => "interactive",
        }
    }
}

impl fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (city, niche) pair; the unit of acquisition, caching and scoring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CityNiche {
    pub city: String,
    pub niche: String,
}

impl CityNiche {
    pub fn new(city: impl Into<String>, niche: impl Into<String>) -> Self {
        Self {
            city: city.into(),
            niche: niche.into(),
        }
    }
}

impl fmt::Display for CityNiche {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.city, self.niche)
    }
}

/// Untyped field text exactly as a channel extracted it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawPayload {
    pub name: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    pub rating: Option<String>,
    pub review_count: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBusinessRecord {
    pub fingerprint: String,
    pub niche: String,
    pub city: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub category: Option<String>,
    pub rating: f64,
    pub review_count: u64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub source_channel: SourceChannel,
    pub discovered_at: DateTime<Utc>,
}

impl RawBusinessRecord {
    /// Parses a channel payload into a typed record, rejecting payloads without a usable name.
    pub fn from_payload(
        key: &CityNiche,
        payload: RawPayload,
        source_channel: SourceChannel,
        discovered_at: DateTime<Utc>,
    ) -> Result<Self, CoreError> {
        let name = payload.name.and_then(text_or_none).ok_or_else(|| {
            CoreError::InvalidRecord(format!("payload for {key} has no name"))
        })?;
        let address = payload.address.and_then(text_or_none);
        let fingerprint = fingerprint::fingerprint(&name, address.as_deref())?;

        Ok(Self {
            fingerprint,
            niche: key.niche.clone(),
            city: key.city.clone(),
            name,
            address,
            phone: payload.phone.and_then(text_or_none),
            website: payload.website.and_then(text_or_none),
            category: payload.category.and_then(text_or_none),
            rating: payload.rating.as_deref().map(parse_rating).unwrap_or(0.0),
            review_count: payload
                .review_count
                .as_deref()
                .map(parse_review_count)
                .unwrap_or(0),
            latitude: payload.latitude.filter(|v| v.is_finite()),
            longitude: payload.longitude.filter(|v| v.is_finite()),
            source_channel,
            discovered_at,
        })
    }

    pub fn key(&self) -> CityNiche {
        CityNiche::new(self.city.clone(), self.niche.clone())
    }
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed == "N/A" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Reads a star rating such as `"4,5 estrelas"` or `"4.7"`; anything outside 0..=5 is 0.
pub fn parse_rating(text: &str) -> f64 {
    text.split_whitespace()
        .next()
        .map(|token| token.replace(',', "."))
        .and_then(|token| token.parse::<f64>().ok())
        .filter(|v| v.is_finite() && (0.0..=5.0).contains(v))
        .unwrap_or(0.0)
}

/// Reads a review count such as `"(1.234)"`, `"1,234 reviews"` or `"87"`.
pub fn parse_review_count(text: &str) -> u64 {
    let inner = match (text.find('('), text.find(')')) {
        (Some(open), Some(close)) if open < close => &text[open + 1..close],
        _ => text,
    };
    let digits = inner
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .replace(['.', ','], "");
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return 0;
    }
    digits.parse().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Low,
    Medium,
    High,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Low => "Low",
            Classification::Medium => "Medium",
            Classification::High => "High",
        }
    }
}

/// Aggregated statistics plus derived score for one (city, niche).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpportunityMetric {
    pub city: String,
    pub niche: String,
    pub company_count: u64,
    pub avg_rating: Option<f64>,
    pub total_reviews: u64,
    pub pct_low_quality: f64,
    pub pct_no_reviews: f64,
    pub score: f64,
    pub classification: Classification,
    pub computed_at: DateTime<Utc>,
}

impl OpportunityMetric {
    pub fn key(&self) -> CityNiche {
        CityNiche::new(self.city.clone(), self.niche.clone())
    }
}

/// Last successful acquisition for a (niche, city); gates re-acquisition only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub niche: String,
    pub city: String,
    pub last_success_at: DateTime<Utc>,
}

/// Append-only record of one completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub cities: BTreeSet<String>,
    pub niches: BTreeSet<String>,
    pub new_metric_rows: usize,
    pub total_rows: usize,
}
