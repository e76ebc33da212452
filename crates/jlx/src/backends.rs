//! 🔌 Backends: where the real I/O happens.
//!
//! 🎭 Everything jlx asks of a cluster goes through one trait: [`Cluster`]. Count the docs,
//! page through them, peek at the circuit breakers, shove documents back in with `_bulk`.
//! The exporter, the retry controller, the backpressure monitor and the restore ingester
//! only ever see the trait. Whether there's a real Elasticsearch on the other end or a
//! `Vec` pretending to be one is none of their business.
//!
//! 🧠 Knowledge graph:
//! - `elasticsearch`: the reqwest-powered real deal.
//! - `in_mem`: test double. Scripted failures, scripted breakers, a bulk endpoint that
//!   remembers everything. Lives behind `cfg(test)` because it lies whenever a test asks it to.
//!
//! 🦆 The duck is here because every file must have one. This is law.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::common::Hit;
use crate::cursor::PagingMode;

pub(crate) mod elasticsearch;
#[cfg(test)]
pub(crate) mod in_mem;

pub use elasticsearch::{ClusterConfig, ElasticsearchCluster};

/// 📡 One page request. Borrowed everything, because the cursor owns the state.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub index: &'a str,
    pub mode: PagingMode,
    pub size: usize,
    /// Point-in-time id when paging with PIT. Always `None` for the scroll-opening search.
    pub token: Option<&'a str>,
    /// "Continue after this key". Empty on the first page.
    pub search_after: &'a [Value],
    /// Lease renewal for the cursor, e.g. `5m`.
    pub keep_alive: &'a str,
}

/// 📦 What came back from one page request.
#[derive(Debug, Default)]
pub struct SearchPage {
    pub hits: Vec<Hit>,
    /// The continuation the next request must carry. `None` means the cluster is done with us.
    pub token: Option<String>,
    /// The cluster's idea of the total. A hint. Sometimes a fib.
    pub reported_total: Option<u64>,
}

/// 🔥 One circuit breaker on one node, fetched fresh. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub node: String,
    pub breaker: String,
    pub estimated_bytes: u64,
    /// `<= 0` means the breaker has no limit.
    pub limit_bytes: i64,
    pub tripped: bool,
}

impl BreakerSnapshot {
    pub fn new(node: impl Into<String>, breaker: impl Into<String>, estimated_bytes: u64, limit_bytes: i64) -> Self {
        let tripped = limit_bytes > 0 && estimated_bytes >= limit_bytes as u64;
        Self {
            node: node.into(),
            breaker: breaker.into(),
            estimated_bytes,
            limit_bytes,
            tripped,
        }
    }

    /// ✅ Healthy means strictly below the limit.
    pub fn is_healthy(&self) -> bool {
        !self.tripped
    }
}

/// 📬 Per-item outcome of one `_bulk` call, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub id: Option<String>,
    pub status: u16,
    /// `type: reason` when the cluster rejected the item.
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && (200..300).contains(&self.status)
    }
}

/// 🎯 The remote surface jlx consumes. Every method may fail transiently; the caller decides
/// whether to retry by sniffing the error with [`crate::error::is_transient`].
#[async_trait]
pub trait Cluster: std::fmt::Debug + Send + Sync {
    /// 🔢 Document count for `index`. Best effort, possibly stale.
    async fn count(&self, index: &str) -> Result<u64>;

    /// 📍 Opens a point-in-time on `index` and returns its id.
    async fn open_point_in_time(&self, index: &str, keep_alive: &str) -> Result<String>;

    /// 📄 Runs one paginated search. For scroll mode this is the opening request.
    async fn search(&self, request: &SearchRequest<'_>) -> Result<SearchPage>;

    /// 🔄 Renews a scroll cursor and fetches the next page.
    async fn refresh_cursor(&self, token: &str, keep_alive: &str) -> Result<SearchPage>;

    /// 🗑️ Lets the cluster free a cursor early. Best effort: leases expire on their own anyway.
    async fn release_cursor(&self, mode: PagingMode, token: &str) -> Result<()>;

    /// 🔥 Every circuit breaker on every node.
    async fn breaker_stats(&self) -> Result<Vec<BreakerSnapshot>>;

    /// 🚚 Submits one NDJSON `_bulk` body and returns per-item results.
    async fn bulk(&self, body: String) -> Result<Vec<BulkItemResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_one_where_the_breaker_at_exactly_the_limit_counts_as_tripped() {
        assert!(!BreakerSnapshot::new("n1", "parent", 100, 100).is_healthy());
        assert!(BreakerSnapshot::new("n1", "parent", 99, 100).is_healthy());
    }

    #[test]
    fn the_one_where_a_limitless_breaker_is_always_chill() {
        assert!(BreakerSnapshot::new("n1", "accounting", u64::MAX, -1).is_healthy());
        assert!(BreakerSnapshot::new("n1", "inflight", 12, 0).is_healthy());
    }

    #[test]
    fn the_one_where_a_201_with_no_error_is_a_success() {
        let ok = BulkItemResult { id: Some("a".into()), status: 201, error: None };
        let rejected = BulkItemResult {
            id: Some("b".into()),
            status: 400,
            error: Some("mapper_parsing_exception: nope".into()),
        };
        assert!(ok.is_success());
        assert!(!rejected.is_success());
    }
}
