//! Ordered per-field extraction strategies for result-card HTML.
//!
//! Each field carries a list of attempts; the first attempt that yields non-empty text wins
//! and its label is logged so selector drift shows up in traces.

use lbof_core::RawPayload;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extraction {
    Text,
    Attr(&'static str),
    /// Text of the innermost matched element whose text contains the needle.
    TextContaining(&'static str),
}

#[derive(Debug, Clone)]
struct Attempt {
    raw_selector: &'static str,
    selector: Selector,
    extraction: Extraction,
}

impl Attempt {
    fn run(&self, root: ElementRef<'_>) -> Option<String> {
        let mut matches = root.select(&self.selector);
        match self.extraction {
            Extraction::Text => matches.next().and_then(|n| text_or_none(element_text(n))),
            Extraction::Attr(attr) => matches
                .next()
                .and_then(|n| n.value().attr(attr))
                .and_then(|s| text_or_none(s.to_string())),
            Extraction::TextContaining(needle) => matches
                .map(element_text)
                .filter(|text| text.contains(needle))
                .last()
                .and_then(text_or_none),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldExtractor {
    field: &'static str,
    attempts: Vec<Attempt>,
    strip_prefix: Option<&'static str>,
}

impl FieldExtractor {
    pub fn new(field: &'static str) -> Self {
        Self {
            field,
            attempts: Vec::new(),
            strip_prefix: None,
        }
    }

    pub fn attempt(
        mut self,
        selector: &'static str,
        extraction: Extraction,
    ) -> Result<Self, ExtractError> {
        let parsed = Selector::parse(selector).map_err(|e| ExtractError::Selector {
            selector,
            message: e.to_string(),
        })?;
        self.attempts.push(Attempt {
            raw_selector: selector,
            selector: parsed,
            extraction,
        });
        Ok(self)
    }

    /// Drops a leading label such as `"Endereço:"` from whatever text wins.
    pub fn strip_prefix(mut self, prefix: &'static str) -> Self {
        self.strip_prefix = Some(prefix);
        self
    }

    pub fn extract(&self, root: ElementRef<'_>) -> Option<String> {
        for attempt in &self.attempts {
            if let Some(text) = attempt.run(root) {
                debug!(field = self.field, selector = attempt.raw_selector, "field extracted");
                let text = match self.strip_prefix {
                    Some(prefix) => text.replace(prefix, ""),
                    None => text,
                };
                return text_or_none(text);
            }
        }
        debug!(field = self.field, "no extraction strategy matched");
        None
    }
}

/// Extractors for every field read off one result card.
#[derive(Debug, Clone)]
pub struct CardExtractor {
    name: FieldExtractor,
    address: FieldExtractor,
    rating: FieldExtractor,
    reviews: FieldExtractor,
}

impl CardExtractor {
    pub fn new(
        name: FieldExtractor,
        address: FieldExtractor,
        rating: FieldExtractor,
        reviews: FieldExtractor,
    ) -> Self {
        Self {
            name,
            address,
            rating,
            reviews,
        }
    }

    /// Selector chains for the Portuguese-locale maps result list.
    pub fn google_maps() -> Result<Self, ExtractError> {
        let name = FieldExtractor::new("name")
            .attempt("a.hfpxzc", Extraction::Attr("aria-label"))?
            .attempt(r#"div[role="heading"]"#, Extraction::Text)?
            .attempt(r#"div[class*="fontHeadlineSmall"]"#, Extraction::Text)?
            .attempt(r#"div[data-section-id="title"]"#, Extraction::Text)?
            .attempt(r#"h2[data-test-id="section-result-title"]"#, Extraction::Text)?;
        let address = FieldExtractor::new("address")
            .attempt(r#"div[class*="address"]"#, Extraction::Text)?
            .attempt("div", Extraction::TextContaining("Endereço:"))?
            .strip_prefix("Endereço:");
        let rating = FieldExtractor::new("rating")
            .attempt(r#"span[aria-label*="estrelas"]"#, Extraction::Attr("aria-label"))?
            .attempt("span.fontBodyMedium > span[aria-label]", Extraction::Attr("aria-label"))?;
        let reviews = FieldExtractor::new("reviews")
            .attempt("span", Extraction::TextContaining("("))?
            .attempt(r#"span[aria-label*="avaliações"]"#, Extraction::Attr("aria-label"))?;
        Ok(Self::new(name, address, rating, reviews))
    }

    pub fn extract(&self, card_html: &str) -> RawPayload {
        let fragment = Html::parse_fragment(card_html);
        let root = fragment.root_element();
        RawPayload {
            name: self.name.extract(root),
            address: self.address.extract(root),
            rating: self.rating.extract(root),
            review_count: self.reviews.extract(root),
            ..RawPayload::default()
        }
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
