//! Open-ended channel over a scroll-driven result list.
//!
//! The channel never decides exhaustion on its own. Each poll advances the surface once and
//! reports the cards that appeared since the previous poll, the visible total and whether an
//! end-of-list marker is showing; the pagination controller turns that into a verdict.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use lbof_core::SourceChannel;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    CardExtractor, ChannelError, ChannelPage, ChannelQuery, ChannelShape, RetrievalChannel,
};

#[async_trait]
pub trait ScrollSurface: Send + Sync {
    /// Scrolls the result list once.
    async fn advance(&mut self) -> Result<(), ChannelError>;
    /// Raw HTML of every result card currently rendered, in list order.
    async fn card_html(&self) -> Result<Vec<String>, ChannelError>;
    async fn end_of_list_visible(&self) -> Result<bool, ChannelError>;
}

#[async_trait]
pub trait SurfaceDriver: Send + Sync {
    async fn open(&self, query: &ChannelQuery) -> Result<Box<dyn ScrollSurface>, ChannelError>;
}

struct Session {
    surface: Box<dyn ScrollSurface>,
    emitted: usize,
}

/// Sessions stay registered while a poll runs, so a poll dropped by a caller's timeout
/// leaves the surface reachable under the same token.
pub struct InteractiveChannel {
    driver: Arc<dyn SurfaceDriver>,
    extractor: CardExtractor,
    sessions: Mutex<HashMap<String, Arc<Mutex<Session>>>>,
    max_attempts: u32,
}

impl InteractiveChannel {
    pub fn new(driver: Arc<dyn SurfaceDriver>, extractor: CardExtractor) -> Self {
        Self {
            driver,
            extractor,
            sessions: Mutex::new(HashMap::new()),
            max_attempts: 2,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn open_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn poll(&self, session: &mut Session, advance: bool) -> Result<ChannelPage, ChannelError> {
        if advance {
            session.surface.advance().await?;
        }
        let cards = session.surface.card_html().await?;
        let end_of_list = session.surface.end_of_list_visible().await?;

        let payloads = cards
            .iter()
            .skip(session.emitted)
            .map(|html| self.extractor.extract(html))
            .collect::<Vec<_>>();
        session.emitted = session.emitted.max(cards.len());

        Ok(ChannelPage {
            payloads,
            next_page_token: None,
            end_of_list,
            visible_count: Some(cards.len()),
        })
    }
}

#[async_trait]
impl RetrievalChannel for InteractiveChannel {
    fn source_channel(&self) -> SourceChannel {
        SourceChannel::Interactive
    }

    fn shape(&self) -> ChannelShape {
        ChannelShape::OpenEnded
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    async fn fetch_page(
        &self,
        query: &ChannelQuery,
        page_token: Option<&str>,
    ) -> Result<ChannelPage, ChannelError> {
        let (token, session) = match page_token {
            None => {
                let surface = self.driver.open(query).await?;
                let session = Arc::new(Mutex::new(Session { surface, emitted: 0 }));
                (Uuid::new_v4().to_string(), session)
            }
            Some(token) => {
                let session = self.sessions.lock().await.get(token).cloned().ok_or_else(|| {
                    ChannelError::Fatal(format!("no open surface for token {token}"))
                })?;
                (token.to_string(), session)
            }
        };

        let polled = {
            let mut guard = session.lock().await;
            self.poll(&mut guard, page_token.is_some()).await
        };
        match polled {
            Ok(mut page) => {
                let mut sessions = self.sessions.lock().await;
                if page.end_of_list {
                    sessions.remove(&token);
                } else {
                    page.next_page_token = Some(token.clone());
                    sessions.insert(token, session);
                }
                drop(sessions);
                debug!(
                    query = %query.search_text(),
                    new_cards = page.payloads.len(),
                    visible = ?page.visible_count,
                    end_of_list = page.end_of_list,
                    "polled interactive surface"
                );
                Ok(page)
            }
            Err(err) => {
                if err.is_fatal() {
                    self.sessions.lock().await.remove(&token);
                }
                Err(err)
            }
        }
    }

    async fn finish(&self, page_token: Option<&str>) {
        if let Some(token) = page_token {
            self.sessions.lock().await.remove(token);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureSnapshot {
    pub cards: Vec<String>,
    #[serde(default)]
    pub end_of_list: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureSurfaceSpec {
    pub query: String,
    pub snapshots: Vec<FixtureSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureFile {
    surfaces: Vec<FixtureSurfaceSpec>,
}

/// Replays recorded result-list snapshots keyed by search text.
#[derive(Debug, Clone, Default)]
pub struct FixtureSurfaceDriver {
    surfaces: HashMap<String, Vec<FixtureSnapshot>>,
}

impl FixtureSurfaceDriver {
    pub fn new(surfaces: Vec<FixtureSurfaceSpec>) -> Self {
        Self {
            surfaces: surfaces
                .into_iter()
                .map(|s| (s.query, s.snapshots))
                .collect(),
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading surface fixture {}", path.display()))?;
        let file: FixtureFile = serde_json::from_str(&text)
            .with_context(|| format!("parsing surface fixture {}", path.display()))?;
        Ok(Self::new(file.surfaces))
    }
}

#[async_trait]
impl SurfaceDriver for FixtureSurfaceDriver {
    async fn open(&self, query: &ChannelQuery) -> Result<Box<dyn ScrollSurface>, ChannelError> {
        let snapshots = self
            .surfaces
            .get(&query.search_text())
            .cloned()
            .unwrap_or_default();
        Ok(Box::new(FixtureSurface {
            snapshots,
            position: 0,
        }))
    }
}

/// Advancing past the last snapshot keeps showing it, like a list that stopped growing.
#[derive(Debug)]
struct FixtureSurface {
    snapshots: Vec<FixtureSnapshot>,
    position: usize,
}

impl FixtureSurface {
    fn current(&self) -> Option<&FixtureSnapshot> {
        self.snapshots.get(self.position)
    }
}

#[async_trait]
impl ScrollSurface for FixtureSurface {
    async fn advance(&mut self) -> Result<(), ChannelError> {
        if self.position + 1 < self.snapshots.len() {
            self.position += 1;
        }
        Ok(())
    }

    async fn card_html(&self) -> Result<Vec<String>, ChannelError> {
        Ok(self.current().map(|s| s.cards.clone()).unwrap_or_default())
    }

    async fn end_of_list_visible(&self) -> Result<bool, ChannelError> {
        Ok(self.current().map(|s| s.end_of_list).unwrap_or(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn card(name: &str) -> String {
        format!(r#"<div><a class="hfpxzc" aria-label="{name}"></a><span>(3)</span></div>"#)
    }

    fn channel(snapshots: Vec<FixtureSnapshot>) -> InteractiveChannel {
        let driver = FixtureSurfaceDriver::new(vec![FixtureSurfaceSpec {
            query: "pet shop Contagem".into(),
            snapshots,
        }]);
        InteractiveChannel::new(Arc::new(driver), CardExtractor::google_maps().unwrap())
    }

    fn snapshot(names: &[&str], end_of_list: bool) -> FixtureSnapshot {
        FixtureSnapshot {
            cards: names.iter().map(|n| card(n)).collect(),
            end_of_list,
        }
    }

    #[tokio::test]
    async fn polls_emit_only_new_cards_until_end_marker() {
        let channel = channel(vec![
            snapshot(&["A", "B"], false),
            snapshot(&["A", "B", "C"], false),
            snapshot(&["A", "B", "C", "D"], true),
        ]);
        let query = ChannelQuery::new("pet shop", "Contagem");

        let first = channel.fetch_page(&query, None).await.unwrap();
        assert_eq!(first.payloads.len(), 2);
        assert_eq!(first.visible_count, Some(2));
        let token = first.next_page_token.clone().unwrap();
        assert_eq!(channel.open_sessions().await, 1);

        let second = channel.fetch_page(&query, Some(&token)).await.unwrap();
        assert_eq!(second.payloads.len(), 1);
        assert_eq!(second.payloads[0].name.as_deref(), Some("C"));

        let third = channel.fetch_page(&query, Some(&token)).await.unwrap();
        assert!(third.end_of_list);
        assert_eq!(third.next_page_token, None);
        assert_eq!(third.payloads[0].name.as_deref(), Some("D"));
        assert_eq!(channel.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn stalled_surface_reports_no_growth() {
        let channel = channel(vec![snapshot(&["A"], false)]);
        let query = ChannelQuery::new("pet shop", "Contagem");
        let first = channel.fetch_page(&query, None).await.unwrap();
        let token = first.next_page_token.unwrap();
        for _ in 0..3 {
            let page = channel.fetch_page(&query, Some(&token)).await.unwrap();
            assert!(page.payloads.is_empty());
            assert_eq!(page.visible_count, Some(1));
        }
        channel.finish(Some(&token)).await;
        assert_eq!(channel.open_sessions().await, 0);
    }

    #[tokio::test]
    async fn unknown_query_is_an_empty_finished_list() {
        let channel = channel(Vec::new());
        let page = channel
            .fetch_page(&ChannelQuery::new("padaria", "Betim"), None)
            .await
            .unwrap();
        assert!(page.payloads.is_empty());
        assert!(page.end_of_list);
    }

    #[tokio::test]
    async fn unknown_token_is_fatal() {
        let channel = channel(Vec::new());
        let err = channel
            .fetch_page(&ChannelQuery::new("pet shop", "Contagem"), Some("nope"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    /// Reveals one more card per advance; the first advance hangs for a while.
    struct SlowFirstAdvance {
        cards: Vec<String>,
        shown: usize,
        delayed: bool,
    }

    #[async_trait]
    impl ScrollSurface for SlowFirstAdvance {
        async fn advance(&mut self) -> Result<(), ChannelError> {
            if !self.delayed {
                self.delayed = true;
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            self.shown = (self.shown + 1).min(self.cards.len());
            Ok(())
        }

        async fn card_html(&self) -> Result<Vec<String>, ChannelError> {
            Ok(self.cards[..self.shown].to_vec())
        }

        async fn end_of_list_visible(&self) -> Result<bool, ChannelError> {
            Ok(self.shown == self.cards.len())
        }
    }

    struct SlowDriver;

    #[async_trait]
    impl SurfaceDriver for SlowDriver {
        async fn open(&self, _query: &ChannelQuery) -> Result<Box<dyn ScrollSurface>, ChannelError> {
            Ok(Box::new(SlowFirstAdvance {
                cards: vec![card("A"), card("B")],
                shown: 1,
                delayed: false,
            }))
        }
    }

    #[tokio::test]
    async fn abandoned_poll_keeps_the_session_open() {
        let channel =
            InteractiveChannel::new(Arc::new(SlowDriver), CardExtractor::google_maps().unwrap());
        let query = ChannelQuery::new("pet shop", "Contagem");

        let first = channel.fetch_page(&query, None).await.unwrap();
        let token = first.next_page_token.unwrap();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            channel.fetch_page(&query, Some(&token)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(channel.open_sessions().await, 1);

        let retried = channel.fetch_page(&query, Some(&token)).await.unwrap();
        assert_eq!(retried.payloads.len(), 1);
        assert_eq!(retried.payloads[0].name.as_deref(), Some("B"));
        assert!(retried.end_of_list);
        assert_eq!(channel.open_sessions().await, 0);
    }

    #[test]
    fn fixture_file_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surfaces.json");
        std::fs::write(
            &path,
            r#"{"surfaces":[{"query":"pet shop Contagem","snapshots":[{"cards":["<div></div>"],"endOfList":true}]}]}"#,
        )
        .unwrap();
        let driver = FixtureSurfaceDriver::load(&path).unwrap();
        assert_eq!(driver.surfaces["pet shop Contagem"].len(), 1);
    }
}
