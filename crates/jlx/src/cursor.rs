//! 🧭 Cursor state: "where are we" in the paginated scan.
//!
//! The exporter owns exactly one of these. Nobody else touches it. The writer doesn't even
//! know it exists, which is the healthiest relationship in the whole crate.
//!
//! 🧠 Knowledge graph:
//! - `PagingMode::PointInTime` → PIT id + `search_after`. No expiry on the sort key, the PIT
//!   lease is renewed every request.
//! - `PagingMode::Scroll` → opaque scroll id, renewed every request. The page size is frozen
//!   by the opening search, which matters for the short-batch rule.
//! - `advance()` applies the termination rules in priority order and says whether to keep going.
//!
//! ⚠️ `reported_total` is a hint. It can undercount, overcount, or be zero. It only ever
//! corroborates. An index that lies about its size must not trap us in a loop.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::SearchPage;

/// 📄 How we page through an index. Picked once per run, never swapped mid-scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PagingMode {
    /// Point-in-time + `search_after` on `_shard_doc`. Elasticsearch 7.12 or newer.
    #[default]
    PointInTime,
    /// Classic scroll cursor with `_doc` order.
    Scroll,
}

/// 🏁 Why the scan stopped, or `Continue` if it didn't.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Continue,
    /// Rule 1: the page came back empty.
    EmptyBatch,
    /// Rule 2: fewer hits than the page could hold.
    ShortBatch,
    /// Rule 3: hits, but nothing to continue from.
    NoContinuation,
    /// Rule 4: we've read at least as many as the cluster claims exist.
    ReachedReportedTotal,
}

impl Termination {
    pub fn is_done(self) -> bool {
        self != Termination::Continue
    }
}

#[derive(Debug, Clone)]
pub struct CursorState {
    mode: PagingMode,
    token: Option<String>,
    last_sort_key: Vec<Value>,
    requested_size: usize,
    consumed_count: u64,
    reported_total: u64,
    /// Scroll only: the size the opening search locked in.
    scroll_page_size: Option<usize>,
}

impl CursorState {
    pub fn new(mode: PagingMode, page_size: usize) -> Self {
        Self {
            mode,
            token: None,
            last_sort_key: Vec::new(),
            requested_size: page_size.max(1),
            consumed_count: 0,
            reported_total: 0,
            scroll_page_size: None,
        }
    }

    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn last_sort_key(&self) -> &[Value] {
        &self.last_sort_key
    }

    /// The configured page size. Retries may shrink a single request; this never shrinks.
    pub fn requested_size(&self) -> usize {
        self.requested_size
    }

    pub fn consumed_count(&self) -> u64 {
        self.consumed_count
    }

    pub fn reported_total(&self) -> u64 {
        self.reported_total
    }

    /// 📍 A scroll is open and the next page must come from `refresh_cursor`.
    pub fn is_scrolling(&self) -> bool {
        self.mode == PagingMode::Scroll && self.token.is_some()
    }

    /// 📍 Records the PIT id before the first search.
    pub fn open(&mut self, token: String) {
        self.token = Some(token);
    }

    pub fn set_reported_total(&mut self, total: u64) {
        self.reported_total = total;
    }

    /// 📏 How many hits a full page holds for a request of `size_used`.
    fn full_page_len(&self, size_used: usize) -> usize {
        match (self.mode, self.scroll_page_size) {
            (PagingMode::Scroll, Some(locked)) => locked,
            _ => size_used,
        }
    }

    /// 🔄 Folds one page into the cursor and applies the termination rules, first match wins.
    ///
    /// `size_used` is what this particular call asked for, which after a retry may be smaller
    /// than [`Self::requested_size`].
    pub fn advance(&mut self, page: &SearchPage, size_used: usize) -> Termination {
        if let Some(total) = page.reported_total.filter(|total| *total > 0) {
            self.reported_total = total;
        }
        // keep the old token when the cluster stops sending one, so it can still be released
        if let Some(token) = page.token.as_ref() {
            self.token = Some(token.clone());
        }

        let returned = page.hits.len();
        if returned == 0 {
            return Termination::EmptyBatch;
        }

        let full_page = self.full_page_len(size_used);
        if self.mode == PagingMode::Scroll && self.scroll_page_size.is_none() {
            self.scroll_page_size = Some(size_used);
        }

        self.consumed_count += returned as u64;
        if let Some(last) = page.hits.last() {
            self.last_sort_key.clone_from(&last.sort);
        }

        if returned < full_page {
            return Termination::ShortBatch;
        }

        let can_continue = match self.mode {
            PagingMode::Scroll => page.token.is_some(),
            PagingMode::PointInTime => page.token.is_some() && !self.last_sort_key.is_empty(),
        };
        if !can_continue {
            return Termination::NoContinuation;
        }

        if self.reported_total > 0 && self.consumed_count >= self.reported_total {
            return Termination::ReachedReportedTotal;
        }
        Termination::Continue
    }
}
