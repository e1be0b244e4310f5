//! Per-(channel, query) termination state machine.

use lbof_adapters::{ChannelPage, ChannelShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    /// Bounded page came back with fewer records than the page size.
    ShortPage,
    NoNextToken,
    EndOfList,
    /// Open-ended list did not grow for the configured number of consecutive polls.
    Stalled,
    PageLimit,
}

impl ExhaustionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExhaustionReason::ShortPage => "short_page",
            ExhaustionReason::NoNextToken => "no_next_token",
            ExhaustionReason::EndOfList => "end_of_list",
            ExhaustionReason::Stalled => "stalled",
            ExhaustionReason::PageLimit => "page_limit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationState {
    Polling,
    Exhausted(ExhaustionReason),
    Failed,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    shape: ChannelShape,
    stall_polls: u32,
    max_pages: u32,
    pages: u32,
    stall_count: u32,
    last_visible: Option<usize>,
    next_token: Option<String>,
    state: PaginationState,
}

impl PaginationController {
    /// `max_pages` caps the number of observed pages (or polls, for open-ended channels).
    pub fn new(shape: ChannelShape, stall_polls: u32, max_pages: u32) -> Self {
        Self {
            shape,
            stall_polls: stall_polls.max(1),
            max_pages: max_pages.max(1),
            pages: 0,
            stall_count: 0,
            last_visible: None,
            next_token: None,
            state: PaginationState::Polling,
        }
    }

    pub fn state(&self) -> &PaginationState {
        &self.state
    }

    pub fn is_polling(&self) -> bool {
        self.state == PaginationState::Polling
    }

    /// Token for the next request; `None` before the first page.
    pub fn next_token(&self) -> Option<&str> {
        self.next_token.as_deref()
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn observe(&mut self, page: &ChannelPage) -> &PaginationState {
        if !self.is_polling() {
            return &self.state;
        }
        self.pages += 1;
        self.next_token = page.next_page_token.clone();

        let verdict = match self.shape {
            ChannelShape::Bounded { page_size } => self.judge_bounded(page, page_size),
            ChannelShape::OpenEnded => self.judge_open_ended(page),
        };
        if let Some(reason) = verdict {
            self.state = PaginationState::Exhausted(reason);
        }
        &self.state
    }

    /// Retry budget for the current page ran out.
    pub fn fail(&mut self) {
        if self.is_polling() {
            self.state = PaginationState::Failed;
        }
    }

    fn judge_bounded(&self, page: &ChannelPage, page_size: usize) -> Option<ExhaustionReason> {
        if page.end_of_list {
            Some(ExhaustionReason::EndOfList)
        } else if page.payloads.len() < page_size {
            Some(ExhaustionReason::ShortPage)
        } else if page.next_page_token.is_none() {
            Some(ExhaustionReason::NoNextToken)
        } else if self.pages >= self.max_pages {
            Some(ExhaustionReason::PageLimit)
        } else {
            None
        }
    }

    fn judge_open_ended(&mut self, page: &ChannelPage) -> Option<ExhaustionReason> {
        if page.end_of_list {
            return Some(ExhaustionReason::EndOfList);
        }

        let previous = self.last_visible.unwrap_or(0);
        let visible = page
            .visible_count
            .unwrap_or(previous + page.payloads.len());
        if self.last_visible.is_some() {
            if visible > previous {
                self.stall_count = 0;
            } else {
                self.stall_count += 1;
            }
        }
        self.last_visible = Some(visible);

        if self.stall_count >= self.stall_polls {
            Some(ExhaustionReason::Stalled)
        } else if self.pages >= self.max_pages {
            Some(ExhaustionReason::PageLimit)
        } else if page.next_page_token.is_none() {
            Some(ExhaustionReason::NoNextToken)
        } else {
            None
        }
    }
}
