use anonchat_core::{ChatMessage, HISTORY_PAGE_SIZE, SCROLL_TOP_THRESHOLD, Timestamp};
use url::Url;

use crate::error::ChatError;

/// Parameters for one backward history fetch, captured when the fetch is
/// dispatched. `generation` is filled in by the session so a completion can
/// be discarded if it outlives the connection that requested it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub before: Option<Timestamp>,
    pub limit: usize,
    pub initial: bool,
}

/// Backward pagination state for one connection.
///
/// The cursor is the oldest timestamp seen in a history page and only ever
/// moves backward. Live messages never touch it. `exhausted` latches once a
/// short page arrives and stays set until the next connection resets the
/// pager.
#[derive(Debug)]
pub struct HistoryPager {
    cursor: Option<Timestamp>,
    exhausted: bool,
    in_flight: bool,
    initial_loaded: bool,
    page_size: usize,
}

impl Default for HistoryPager {
    fn default() -> Self {
        Self::with_page_size(HISTORY_PAGE_SIZE)
    }
}

impl HistoryPager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            cursor: None,
            exhausted: false,
            in_flight: false,
            initial_loaded: false,
            page_size,
        }
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    /// Back to the state of a fresh connection: no cursor, not exhausted.
    pub fn reset(&mut self) {
        self.cursor = None;
        self.exhausted = false;
        self.in_flight = false;
        self.initial_loaded = false;
    }

    /// Start a fetch unless one is already outstanding or history is
    /// exhausted; at most one fetch is in flight at any time.
    pub fn begin_fetch(&mut self) -> Option<PageRequest> {
        if self.in_flight || self.exhausted {
            return None;
        }
        self.in_flight = true;
        Some(PageRequest {
            before: self.cursor.clone(),
            limit: self.page_size,
            initial: !self.initial_loaded,
        })
    }

    /// Record a completed page: move the cursor to the page's oldest
    /// timestamp and latch exhaustion when the page came back short.
    pub fn complete(&mut self, page_oldest: Option<Timestamp>, returned: usize) {
        self.in_flight = false;
        self.initial_loaded = true;
        if let Some(timestamp) = page_oldest {
            self.cursor = Some(timestamp);
        }
        if returned < self.page_size {
            self.exhausted = true;
        }
    }

    /// A failed fetch leaves cursor and exhaustion untouched so the caller
    /// may retry.
    pub fn fail(&mut self) {
        self.in_flight = false;
    }

    /// Whether a scroll-triggered (non-initial) fetch is currently allowed.
    pub fn ready_for_more(&self) -> bool {
        self.initial_loaded && !self.in_flight && !self.exhausted
    }
}

/// Edge-triggered scroll policy: fire only near the top of the message
/// list, after the initial load, with no fetch outstanding and history not
/// exhausted.
pub fn should_fetch_older(distance_from_top: f32, pager: &HistoryPager) -> bool {
    distance_from_top < SCROLL_TOP_THRESHOLD && pager.ready_for_more()
}

/// HTTP client for the paginated history endpoint.
#[derive(Debug, Clone)]
pub struct HistoryClient {
    http: reqwest::Client,
    api_url: Url,
}

impl HistoryClient {
    pub fn new(http: reqwest::Client, api_url: Url) -> Self {
        Self { http, api_url }
    }

    /// `GET /api/messages?limit=<n>[&before_timestamp=<cursor>]`, returning
    /// an ascending page of at most `limit` messages.
    pub async fn fetch_page(
        &self,
        limit: usize,
        before: Option<&str>,
    ) -> Result<Vec<ChatMessage>, ChatError> {
        let endpoint = self
            .api_url
            .join("/api/messages")
            .map_err(|err| ChatError::HistoryFetchFailed(err.to_string()))?;

        let mut request = self
            .http
            .get(endpoint)
            .query(&[("limit", limit.to_string())]);
        if let Some(cursor) = before {
            request = request.query(&[("before_timestamp", cursor)]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| ChatError::HistoryFetchFailed(err.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::HistoryFetchFailed(format!(
                "server returned HTTP {}",
                response.status()
            )));
        }

        response
            .json::<Vec<ChatMessage>>()
            .await
            .map_err(|err| ChatError::HistoryFetchFailed(err.to_string()))
    }
}
