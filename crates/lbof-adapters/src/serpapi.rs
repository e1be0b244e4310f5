//! Bounded channel over the SerpApi `google_maps` engine.

use std::sync::Arc;

use async_trait::async_trait;
use lbof_core::{RawPayload, SourceChannel};
use lbof_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::{
    json_f64, json_str, json_text, ChannelError, ChannelPage, ChannelQuery, ChannelShape,
    RetrievalChannel,
};

pub const SERPAPI_ENDPOINT: &str = "https://serpapi.com/search.json";
/// Results per page for the maps engine.
pub const SERPAPI_PAGE_SIZE: usize = 20;

const NO_RESULTS_MARKER: &str = "hasn't returned any results";
const FATAL_MARKERS: &[&str] = &[
    "invalid api key",
    "run out of searches",
    "searches per month",
    "daily limit",
    "account has been suspended",
];

#[derive(Debug)]
pub struct SerpApiChannel {
    http: Arc<HttpFetcher>,
    api_key: String,
    endpoint: String,
    language: String,
    max_attempts: u32,
}

impl SerpApiChannel {
    pub fn new(http: Arc<HttpFetcher>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            endpoint: SERPAPI_ENDPOINT.to_string(),
            language: "pt".to_string(),
            max_attempts: 3,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }
}

#[async_trait]
impl RetrievalChannel for SerpApiChannel {
    fn source_channel(&self) -> SourceChannel {
        SourceChannel::SerpApi
    }

    fn shape(&self) -> ChannelShape {
        ChannelShape::Bounded {
            page_size: SERPAPI_PAGE_SIZE,
        }
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn fetch_page(
        &self,
        query: &ChannelQuery,
        page_token: Option<&str>,
    ) -> Result<ChannelPage, ChannelError> {
        let start = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ChannelError::Fatal(format!("malformed page token {token:?}")))?,
            None => 0,
        };
        let params = [
            ("engine", "google_maps".to_string()),
            ("q", query.search_text()),
            ("type", "search".to_string()),
            ("hl", self.language.clone()),
            ("start", start.to_string()),
            ("api_key", self.api_key.clone()),
        ];

        let response = self
            .http
            .get(SourceChannel::SerpApi.as_str(), &self.endpoint, &params)
            .await
            .map_err(map_fetch_error)?;
        let body: JsonValue = serde_json::from_slice(&response.body)
            .map_err(|e| ChannelError::Transient(format!("decoding response body: {e}")))?;
        parse_response(&body, start)
    }
}

/// Turns one response document into a page. Error documents are classified, not parsed.
pub fn parse_response(body: &JsonValue, start: usize) -> Result<ChannelPage, ChannelError> {
    if let Some(message) = json_str(body, &["error"]) {
        return classify_error_message(message);
    }

    let payloads = body
        .get("local_results")
        .and_then(JsonValue::as_array)
        .map(|results| results.iter().map(local_result_payload).collect::<Vec<_>>())
        .unwrap_or_default();

    let has_next = body
        .get("serpapi_pagination")
        .and_then(|p| p.get("next"))
        .is_some();
    let next_page_token = has_next.then(|| (start + SERPAPI_PAGE_SIZE).to_string());
    debug!(start, results = payloads.len(), has_next, "parsed serpapi page");

    Ok(ChannelPage {
        end_of_list: payloads.is_empty() && !has_next,
        payloads,
        next_page_token,
        visible_count: None,
    })
}

fn local_result_payload(result: &JsonValue) -> RawPayload {
    RawPayload {
        name: json_text(result, &["title"]),
        address: json_text(result, &["address"]),
        phone: json_text(result, &["phone"]),
        website: json_text(result, &["website"]),
        category: json_text(result, &["type"]),
        rating: json_text(result, &["rating"]),
        review_count: json_text(result, &["reviews"]),
        latitude: json_f64(result, &["gps_coordinates", "latitude"]),
        longitude: json_f64(result, &["gps_coordinates", "longitude"]),
    }
}

fn classify_error_message(message: &str) -> Result<ChannelPage, ChannelError> {
    let lowered = message.to_lowercase();
    if lowered.contains(NO_RESULTS_MARKER) {
        return Ok(ChannelPage::empty_end());
    }
    if FATAL_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        warn!(%message, "serpapi rejected the account");
        return Err(ChannelError::Fatal(message.to_string()));
    }
    Err(ChannelError::Transient(message.to_string()))
}

/// Error bodies carry the real reason (quota vs. throttling) even on non-2xx statuses.
fn map_fetch_error(err: FetchError) -> ChannelError {
    if let FetchError::HttpStatus { body, .. } = &err {
        let message = serde_json::from_str::<JsonValue>(body)
            .ok()
            .and_then(|v| json_str(&v, &["error"]).map(ToString::to_string));
        if let Some(message) = message {
            return match classify_error_message(&message) {
                Err(ChannelError::Transient(_)) => ChannelError::from(err),
                Err(fatal) => fatal,
                Ok(_) => ChannelError::Transient(message),
            };
        }
    }
    ChannelError::from(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn results(n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| {
                json!({
                    "title": format!("Empresa{i}"),
                    "address": format!("Rua {i}"),
                    "rating": 4.5,
                    "reviews": 12,
                    "type": "Pet shop",
                    "gps_coordinates": {"latitude": -19.9, "longitude": -44.0}
                })
            })
            .collect()
    }

    #[test]
    fn full_page_with_next_link_yields_offset_token() {
        let body = json!({
            "local_results": results(20),
            "serpapi_pagination": {"next": "https://serpapi.com/search.json?start=20"}
        });
        let page = parse_response(&body, 0).unwrap();
        assert_eq!(page.payloads.len(), 20);
        assert_eq!(page.next_page_token.as_deref(), Some("20"));
        assert!(!page.end_of_list);

        let first = &page.payloads[0];
        assert_eq!(first.name.as_deref(), Some("Empresa0"));
        assert_eq!(first.rating.as_deref(), Some("4.5"));
        assert_eq!(first.review_count.as_deref(), Some("12"));
        assert_eq!(first.category.as_deref(), Some("Pet shop"));
        assert_eq!(first.latitude, Some(-19.9));
    }

    #[test]
    fn page_without_next_link_has_no_token() {
        let body = json!({"local_results": results(7)});
        let page = parse_response(&body, 40).unwrap();
        assert_eq!(page.payloads.len(), 7);
        assert_eq!(page.next_page_token, None);
    }

    #[test]
    fn no_results_error_is_an_empty_final_page() {
        let body = json!({"error": "Google hasn't returned any results for this query."});
        let page = parse_response(&body, 0).unwrap();
        assert!(page.payloads.is_empty());
        assert!(page.end_of_list);
    }

    #[test]
    fn quota_and_auth_errors_are_fatal() {
        let quota = json!({"error": "Your account has run out of searches."});
        assert!(matches!(parse_response(&quota, 0), Err(ChannelError::Fatal(_))));
        let auth = json!({"error": "Invalid API key. Your API key should be here: ..."});
        assert!(matches!(parse_response(&auth, 0), Err(ChannelError::Fatal(_))));
    }

    #[test]
    fn other_errors_are_transient() {
        let body = json!({"error": "Internal error, please retry."});
        assert!(matches!(parse_response(&body, 0), Err(ChannelError::Transient(_))));
    }

    #[test]
    fn throttled_status_with_quota_body_is_fatal() {
        let err = FetchError::HttpStatus {
            status: 429,
            url: "/search.json".into(),
            body: r#"{"error":"Your account has run out of searches."}"#.into(),
        };
        assert!(map_fetch_error(err).is_fatal());

        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "/search.json".into(),
            body: r#"{"error":"Too many requests, slow down."}"#.into(),
        };
        assert!(!map_fetch_error(throttled).is_fatal());
    }
}
