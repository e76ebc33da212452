//! 🚀 The exporter: producer half of a dump.
//!
//! 🎬 *[narrator voice]* It asked the cluster for a thousand documents. The cluster said 429.
//! It asked for five hundred. The cluster said fine. It never asked for a thousand again...
//! until the very next page, because every page starts fresh.
//!
//! Owns the [`CursorState`], drives the paging loop through the retry controller, stuffs
//! each page into a pooled [`HitBatch`] and pushes it onto the bounded queue. When the queue
//! is full, `send` parks this task until the writer catches up. That's the whole memory story.
//!
//! 🧠 Knowledge graph:
//! - count first (best effort, one shot, warn on failure), then page until a termination rule fires
//! - point-in-time: open the PIT up front, every page is a `search` with `search_after`
//! - scroll: the first page opens the scroll, every later page is `refresh_cursor`
//! - the cursor is released on the way out, success or not. Best effort, short timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backends::{Cluster, SearchPage, SearchRequest};
use crate::common::{BatchPool, HitBatch};
use crate::cursor::{CursorState, PagingMode, Termination};
use crate::error::Cancelled;
use crate::progress::ProgressMetrics;
use crate::retry::{Attempted, RetryController};

// ⏱️ releasing a cursor is a courtesy. courtesies don't get to hold up the exit.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// 🏁 How a finished export went.
#[derive(Debug, Clone)]
pub struct DumpSummary {
    pub docs: u64,
    /// Non-empty pages sent to the writer.
    pub pages: u64,
    /// Last total the cluster reported. Informational only.
    pub reported_total: u64,
    pub termination: Termination,
}

#[derive(Debug)]
pub struct Exporter {
    cluster: Arc<dyn Cluster>,
    retry: RetryController,
    index: String,
    keep_alive: String,
    cursor: CursorState,
    pool: BatchPool,
    progress: ProgressMetrics,
}

impl Exporter {
    pub fn new(
        cluster: Arc<dyn Cluster>,
        retry: RetryController,
        index: impl Into<String>,
        mode: PagingMode,
        page_size: usize,
        keep_alive: impl Into<String>,
        pool: BatchPool,
    ) -> Self {
        let index = index.into();
        Self {
            cluster,
            retry,
            progress: ProgressMetrics::hidden(index.clone()),
            index,
            keep_alive: keep_alive.into(),
            cursor: CursorState::new(mode, page_size),
            pool,
        }
    }

    /// 📊 Swap in a visible progress bar.
    pub(crate) fn with_progress(mut self, progress: ProgressMetrics) -> Self {
        self.progress = progress;
        self
    }

    /// 🔄 Pages through the whole index, sending every non-empty page down `tx`.
    ///
    /// Returns when a termination rule fires. Any error (retry budget blown, fatal response,
    /// writer gone, cancellation) ends the run after a best-effort cursor release.
    pub async fn run(mut self, tx: Sender<HitBatch>, cancel: CancellationToken) -> Result<DumpSummary> {
        let expected = self.best_effort_count(&cancel).await?;
        self.cursor.set_reported_total(expected);
        self.progress.set_expected(expected);
        info!(
            "🚀 dumping '{}' ({:?}, {} per page), cluster says ~{} docs",
            self.index,
            self.cursor.mode(),
            self.cursor.requested_size(),
            expected
        );

        let outcome = self.page_until_done(&tx, &cancel).await;
        self.release_cursor().await;
        self.progress.finish();
        // -- 🚪 dropping the sender is how the writer learns there's nothing left
        drop(tx);

        let (pages, termination) = outcome?;
        info!(
            "✅ '{}' done: {} docs in {} pages ({:?})",
            self.index,
            self.cursor.consumed_count(),
            pages,
            termination
        );
        Ok(DumpSummary {
            docs: self.cursor.consumed_count(),
            pages,
            reported_total: self.cursor.reported_total(),
            termination,
        })
    }

    /// 🔢 One `_count`, no retries. A wrong or missing count only costs us the progress bar.
    async fn best_effort_count(&self, cancel: &CancellationToken) -> Result<u64> {
        let counted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            counted = self.cluster.count(&self.index) => counted,
        };
        Ok(counted.unwrap_or_else(|err| {
            warn!("⚠️ couldn't count '{}', paging blind: {err:#}", self.index);
            0
        }))
    }

    async fn page_until_done(&mut self, tx: &Sender<HitBatch>, cancel: &CancellationToken) -> Result<(u64, Termination)> {
        if self.cursor.mode() == PagingMode::PointInTime {
            let pit = self.open_point_in_time(cancel).await?;
            self.cursor.open(pit);
        }

        let mut pages = 0u64;
        loop {
            let fetched = self.fetch_page(cancel).await?;
            if fetched.retries > 0 {
                debug!("📉 page {} needed {} retries, landed at size {}", pages + 1, fetched.retries, fetched.size);
            }
            let page = fetched.value;
            let termination = self.cursor.advance(&page, fetched.size);

            if !page.hits.is_empty() {
                pages += 1;
                let batch = self.fill_batch(page, pages);
                self.progress.update(batch.len() as u64, batch.source_bytes() as u64);
                info!(
                    "📦 wrote {} of ~{} from '{}'",
                    self.cursor.consumed_count(),
                    self.cursor.reported_total(),
                    self.index
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Cancelled.into()),
                    sent = tx.send(batch) => {
                        if sent.is_err() {
                            // -- the writer only drops the queue when it has failed, and its own
                            //    error is the one worth reporting
                            debug!("🛑 the writer hung up, stopping the export");
                            return Err(Cancelled.into());
                        }
                    }
                }
            }

            if termination.is_done() {
                return Ok((pages, termination));
            }
        }
    }

    async fn open_point_in_time(&self, cancel: &CancellationToken) -> Result<String> {
        let cluster = &self.cluster;
        let index = self.index.as_str();
        let keep_alive = self.keep_alive.as_str();
        let opened = self
            .retry
            .attempt("open point-in-time", 1, cancel, move |_| async move {
                cluster.open_point_in_time(index, keep_alive).await
            })
            .await
            .with_context(|| format!("💀 couldn't open a point-in-time on '{}'", self.index))?;
        Ok(opened.value)
    }

    /// 📄 One page through the retry controller. Scroll refreshes can't shrink: the opening
    /// search already fixed the page size.
    async fn fetch_page(&self, cancel: &CancellationToken) -> Result<Attempted<SearchPage>> {
        let cluster = &self.cluster;
        let cursor = &self.cursor;
        let keep_alive = self.keep_alive.as_str();

        if let (true, Some(token)) = (cursor.is_scrolling(), cursor.token()) {
            return self
                .retry
                .attempt("scroll", cursor.requested_size(), cancel, move |_| async move {
                    cluster.refresh_cursor(token, keep_alive).await
                })
                .await;
        }

        let index = self.index.as_str();
        self.retry
            .attempt("search", cursor.requested_size(), cancel, move |size| async move {
                let request = SearchRequest {
                    index,
                    mode: cursor.mode(),
                    size,
                    token: cursor.token().filter(|_| cursor.mode() == PagingMode::PointInTime),
                    search_after: cursor.last_sort_key(),
                    keep_alive,
                };
                cluster.search(&request).await
            })
            .await
    }

    fn fill_batch(&self, page: SearchPage, page_number: u64) -> HitBatch {
        let mut batch = self.pool.checkout();
        batch.hits.extend(page.hits);
        batch.last_sort.extend_from_slice(self.cursor.last_sort_key());
        batch.page_number = page_number;
        batch
    }

    async fn release_cursor(&self) {
        let Some(token) = self.cursor.token() else {
            return;
        };
        match tokio::time::timeout(RELEASE_TIMEOUT, self.cluster.release_cursor(self.cursor.mode(), token)).await {
            Ok(Ok(())) => debug!("🗑️ released {:?} cursor", self.cursor.mode()),
            Ok(Err(err)) => warn!("⚠️ couldn't release the cursor, it will expire on its own: {err:#}"),
            Err(_) => warn!("⚠️ cursor release timed out, it will expire on its own"),
        }
    }
}
