//! # Previously, on jlx...
//!
//! 🎬 The cluster was down. Or expensive. Or in another datacenter. So we built one out of
//! a `Vec` and a few `Mutex`es. It pages, it scrolls, it trips breakers on command, it
//! accepts bulk bodies and remembers every document. It also lies whenever a test asks it to.
//!
//! ⚠️ Test-only. If this is in a release binary, something went very wrong.
//!
//! ✅ No network calls. No disk I/O. Just vibes and heap memory.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};
use serde_json::value::RawValue;

use super::{BreakerSnapshot, BulkItemResult, Cluster, SearchPage, SearchRequest};
use crate::common::Hit;
use crate::cursor::PagingMode;
use crate::error::TransientError;

/// 🎭 What the next scripted call should do instead of succeeding.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Failure {
    Transient(u16),
    Fatal,
}

impl Failure {
    fn into_error(self, what: &str) -> anyhow::Error {
        match self {
            Failure::Transient(status) => {
                anyhow::Error::new(TransientError::new(Some(status), format!("scripted {what} failure")))
            }
            Failure::Fatal => anyhow::anyhow!("💀 scripted fatal {what} failure"),
        }
    }
}

#[derive(Debug)]
struct ScrollState {
    next: usize,
    page_size: usize,
}

#[derive(Debug, Default)]
pub(crate) struct InMemoryCluster {
    index: String,
    docs: Vec<(String, String)>,
    count_override: Option<u64>,
    total_override: Option<u64>,
    search_failures: Mutex<VecDeque<Failure>>,
    bulk_failures: Mutex<VecDeque<Failure>>,
    breaker_script: Mutex<VecDeque<Option<Vec<BreakerSnapshot>>>>,
    reject_ids: HashSet<String>,
    scrolls: Mutex<HashMap<String, ScrollState>>,
    next_scroll: AtomicUsize,
    pub(crate) search_sizes: Mutex<Vec<usize>>,
    pub(crate) search_after_seen: Mutex<Vec<Vec<Value>>>,
    pub(crate) breaker_polls: AtomicUsize,
    pub(crate) bulk_calls: AtomicUsize,
    pub(crate) released: Mutex<Vec<String>>,
    pub(crate) indexed: Mutex<BTreeMap<(String, String), String>>,
}

impl InMemoryCluster {
    /// 📦 `count` docs in `index`, ids `doc-0..`, sources `{"n":i}`.
    pub(crate) fn with_docs(index: &str, count: usize) -> Self {
        let docs = (0..count)
            .map(|i| (format!("doc-{i}"), format!(r#"{{"n":{i}}}"#)))
            .collect();
        Self {
            index: index.to_string(),
            docs,
            ..Self::default()
        }
    }

    /// 🎭 Make `_count` report a number of our choosing.
    pub(crate) fn lying_count(mut self, count: u64) -> Self {
        self.count_override = Some(count);
        self
    }

    /// 🎭 Make search responses report a total of our choosing.
    pub(crate) fn lying_total(mut self, total: u64) -> Self {
        self.total_override = Some(total);
        self
    }

    pub(crate) fn failing_searches(self, failures: impl IntoIterator<Item = Failure>) -> Self {
        self.search_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(failures);
        self
    }

    pub(crate) fn failing_bulks(self, failures: impl IntoIterator<Item = Failure>) -> Self {
        self.bulk_failures
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(failures);
        self
    }

    /// 🔥 Each entry answers one poll: `Some(snapshots)` or `None` for a failed stats call.
    /// Once the script runs out, every breaker is healthy.
    pub(crate) fn breaker_script(self, polls: impl IntoIterator<Item = Option<Vec<BreakerSnapshot>>>) -> Self {
        self.breaker_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(polls);
        self
    }

    pub(crate) fn rejecting(mut self, ids: impl IntoIterator<Item = &'static str>) -> Self {
        self.reject_ids = ids.into_iter().map(str::to_string).collect();
        self
    }

    pub(crate) fn searches(&self) -> Vec<usize> {
        self.search_sizes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub(crate) fn indexed_docs(&self) -> BTreeMap<(String, String), String> {
        self.indexed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn next_failure(queue: &Mutex<VecDeque<Failure>>) -> Option<Failure> {
        queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    fn hit(&self, position: usize) -> Result<Hit> {
        let (id, source) = &self.docs[position];
        Ok(Hit {
            id: id.clone(),
            index: self.index.clone(),
            source: Some(RawValue::from_string(source.clone())?),
            sort: vec![json!(position)],
        })
    }

    fn page(&self, start: usize, size: usize, token: Option<String>) -> Result<SearchPage> {
        let end = (start + size).min(self.docs.len());
        let hits = (start.min(end)..end).map(|i| self.hit(i)).collect::<Result<Vec<_>>>()?;
        Ok(SearchPage {
            hits,
            token,
            reported_total: Some(self.total_override.unwrap_or(self.docs.len() as u64)),
        })
    }
}

#[async_trait]
impl Cluster for InMemoryCluster {
    async fn count(&self, _index: &str) -> Result<u64> {
        Ok(self.count_override.unwrap_or(self.docs.len() as u64))
    }

    async fn open_point_in_time(&self, _index: &str, _keep_alive: &str) -> Result<String> {
        Ok("pit-0".to_string())
    }

    async fn search(&self, request: &SearchRequest<'_>) -> Result<SearchPage> {
        self.search_sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.size);
        self.search_after_seen
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.search_after.to_vec());
        if let Some(failure) = Self::next_failure(&self.search_failures) {
            return Err(failure.into_error("search"));
        }

        match request.mode {
            PagingMode::PointInTime => {
                let pit = request.token.context("💀 PIT search without a PIT")?;
                let start = match request.search_after.first().and_then(Value::as_u64) {
                    Some(last) => last as usize + 1,
                    None => 0,
                };
                self.page(start, request.size, Some(pit.to_string()))
            }
            PagingMode::Scroll => {
                let token = format!("scroll-{}", self.next_scroll.fetch_add(1, Ordering::Relaxed));
                let page = self.page(0, request.size, Some(token.clone()))?;
                self.scrolls.lock().unwrap_or_else(|p| p.into_inner()).insert(
                    token,
                    ScrollState {
                        next: page.hits.len(),
                        page_size: request.size,
                    },
                );
                Ok(page)
            }
        }
    }

    async fn refresh_cursor(&self, token: &str, _keep_alive: &str) -> Result<SearchPage> {
        if let Some(failure) = Self::next_failure(&self.search_failures) {
            return Err(failure.into_error("scroll"));
        }
        let (start, size) = {
            let mut scrolls = self.scrolls.lock().unwrap_or_else(|p| p.into_inner());
            let state = scrolls
                .get_mut(token)
                .with_context(|| format!("💀 unknown scroll '{token}'"))?;
            let start = state.next;
            state.next = (state.next + state.page_size).min(self.docs.len());
            (start, state.page_size)
        };
        self.search_sizes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(size);
        self.page(start, size, Some(token.to_string()))
    }

    async fn release_cursor(&self, _mode: PagingMode, token: &str) -> Result<()> {
        self.released
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(token.to_string());
        Ok(())
    }

    async fn breaker_stats(&self) -> Result<Vec<BreakerSnapshot>> {
        self.breaker_polls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .breaker_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        match scripted {
            Some(Some(snapshots)) => Ok(snapshots),
            Some(None) => Err(anyhow::Error::new(TransientError::new(Some(503), "stats unavailable"))),
            None => Ok(vec![BreakerSnapshot::new("node-0", "parent", 1, 100)]),
        }
    }

    async fn bulk(&self, body: String) -> Result<Vec<BulkItemResult>> {
        self.bulk_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = Self::next_failure(&self.bulk_failures) {
            return Err(failure.into_error("bulk"));
        }

        let mut results = Vec::new();
        let mut lines = body.lines();
        while let Some(action_line) = lines.next() {
            let action: Value = serde_json::from_str(action_line)?;
            let source = lines.next().context("💀 bulk action without a source line")?;
            let meta = &action["index"];
            let id = meta["_id"].as_str().map(str::to_string);
            let index = meta["_index"].as_str().unwrap_or_default().to_string();
            let rejected = id.as_ref().is_some_and(|id| self.reject_ids.contains(id));
            if rejected {
                results.push(BulkItemResult {
                    id,
                    status: 400,
                    error: Some("mapper_parsing_exception: scripted rejection".to_string()),
                });
                continue;
            }
            let key = id.clone().unwrap_or_else(|| format!("auto-{}", results.len()));
            self.indexed
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert((index, key), source.to_string());
            results.push(BulkItemResult { id, status: 201, error: None });
        }
        Ok(results)
    }
}
