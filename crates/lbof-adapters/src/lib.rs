//! Retrieval channel contract + the paged-API and interactive-surface channels.

use async_trait::async_trait;
use lbof_core::{RawPayload, SourceChannel};
use lbof_storage::{FetchError, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod extract;
pub mod interactive;
pub mod serpapi;

pub use extract::{CardExtractor, Extraction, ExtractError, FieldExtractor};
pub use interactive::{
    FixtureSurfaceDriver, InteractiveChannel, ScrollSurface, SurfaceDriver,
};
pub use serpapi::SerpApiChannel;

pub const CRATE_NAME: &str = "lbof-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelQuery {
    pub niche: String,
    pub city: String,
}

impl ChannelQuery {
    pub fn new(niche: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            niche: niche.into(),
            city: city.into(),
        }
    }

    pub fn search_text(&self) -> String {
        format!("{} {}", self.niche, self.city)
    }
}

/// How a channel signals the end of its result stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelShape {
    /// Fixed page size; a short page or a missing next token ends the stream.
    Bounded { page_size: usize },
    /// No reliable token; exhaustion is inferred from growth of the visible list.
    OpenEnded,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelPage {
    pub payloads: Vec<RawPayload>,
    pub next_page_token: Option<String>,
    /// Explicit "no more results" signal from upstream.
    pub end_of_list: bool,
    /// Total records visible on an open-ended surface after this poll.
    pub visible_count: Option<usize>,
}

impl ChannelPage {
    pub fn empty_end() -> Self {
        Self {
            end_of_list: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("transient channel error: {0}")]
    Transient(String),
    /// Authentication or quota failure; the channel is unusable for the rest of the run.
    #[error("fatal channel error: {0}")]
    Fatal(String),
}

impl ChannelError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChannelError::Fatal(_))
    }
}

impl From<FetchError> for ChannelError {
    fn from(err: FetchError) -> Self {
        match err.disposition() {
            RetryDisposition::Fatal => ChannelError::Fatal(err.to_string()),
            RetryDisposition::Retryable => ChannelError::Transient(err.to_string()),
        }
    }
}

#[async_trait]
pub trait RetrievalChannel: Send + Sync {
    fn source_channel(&self) -> SourceChannel;
    fn shape(&self) -> ChannelShape;

    /// Attempts allowed per page before the page counts as failed.
    fn max_attempts(&self) -> u32 {
        3
    }

    async fn fetch_page(
        &self,
        query: &ChannelQuery,
        page_token: Option<&str>,
    ) -> Result<ChannelPage, ChannelError>;

    /// Releases any per-query state held behind `page_token`.
    async fn finish(&self, _page_token: Option<&str>) {}
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_f64()
}

/// Renders a scalar as text whether upstream sent it as a number or a string.
fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_text_joins_niche_and_city() {
        assert_eq!(
            ChannelQuery::new("pet shop", "Contagem").search_text(),
            "pet shop Contagem"
        );
    }

    #[test]
    fn fetch_errors_map_onto_channel_errors() {
        let fatal: ChannelError = FetchError::HttpStatus {
            status: 401,
            url: "/search.json".into(),
            body: String::new(),
        }
        .into();
        assert!(fatal.is_fatal());

        let transient: ChannelError = FetchError::HttpStatus {
            status: 503,
            url: "/search.json".into(),
            body: String::new(),
        }
        .into();
        assert!(!transient.is_fatal());
    }

    #[test]
    fn json_helpers_follow_paths() {
        let value = json!({"a": {"b": "x", "n": 4.5, "i": 12}});
        assert_eq!(json_str(&value, &["a", "b"]), Some("x"));
        assert_eq!(json_f64(&value, &["a", "n"]), Some(4.5));
        assert_eq!(json_text(&value, &["a", "i"]).as_deref(), Some("12"));
        assert_eq!(json_text(&value, &["a", "missing"]), None);
    }
}
