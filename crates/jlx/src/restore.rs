//! 📥 Bulk restore: NDJSON lines back into an index, one `_bulk` body at a time.
//!
//! ```text
//! LineReader ──lines──▶ Ingester ──BulkItem (MPMC)──▶ BulkWorker × N ──▶ _bulk
//!                          │                               │
//!                          └──────── StatsEvent ───────────┴──▶ stats task ──▶ RestoreStats
//! ```
//!
//! 🧠 Knowledge graph:
//! - a malformed line is skipped and counted, never fatal
//! - a rejected item is counted as failed, never fatal
//! - a `_bulk` request that exhausts its retries (or fails outright) fails all of its items
//! - each worker flushes when its body reaches `flush_bytes` or the flush interval ticks
//! - stats come from exactly one task folding outcome events, so nobody shares a counter
//! - fatal: input open/read failure. Everything already submitted stays submitted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use serde::Serialize;
use serde_json::json;
use serde_json::value::RawValue;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app_config::{AppConfig, RestoreConfig};
use crate::backends::{BulkItemResult, Cluster};
use crate::backpressure::BackpressureMonitor;
use crate::common::RestoreLine;
use crate::error::{Cancelled, is_cancelled};
use crate::input::{InputLine, InputSource, LineReader, ReaderSummary};
use crate::retry::RetryController;
use crate::supervisor::Worker;

/// 📊 The final word on a restore. Printed as pretty JSON when the run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreStats {
    /// Items handed to the worker pool.
    pub added: u64,
    /// Items that went out in a `_bulk` body, whatever happened to them after.
    pub flushed: u64,
    pub indexed: u64,
    pub failed: u64,
    /// `_bulk` requests that got an answer.
    pub requests: u64,
    /// Lines that never became items: malformed, not an object, or no index to go to.
    pub skipped: u64,
}

/// 🎯 What became of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Pending,
    Success,
    Failure(String),
}

/// 📦 One document on its way back in.
#[derive(Debug)]
pub struct BulkItem {
    pub id: Option<String>,
    pub index: String,
    pub body: Box<RawValue>,
    pub outcome: ItemOutcome,
}

impl BulkItem {
    /// 🧵 The action line plus the source line, newline-terminated.
    fn encode_into(&self, out: &mut String) -> Result<()> {
        let action = match &self.id {
            Some(id) => json!({ "index": { "_index": self.index, "_id": id } }),
            None => json!({ "index": { "_index": self.index } }),
        };
        out.push_str(&serde_json::to_string(&action).context("💀 bulk action line refused to serialize")?);
        out.push('\n');
        out.push_str(self.body.get());
        out.push('\n');
        Ok(())
    }

    fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("<auto id>")
    }
}

/// 📡 Everything the stats task needs to hear about.
#[derive(Debug)]
enum StatsEvent {
    Added,
    Skipped,
    Flushed(u64),
    Requested,
    Completed(ItemOutcome),
}

impl RestoreStats {
    fn apply(&mut self, event: StatsEvent) {
        match event {
            StatsEvent::Added => self.added += 1,
            StatsEvent::Skipped => self.skipped += 1,
            StatsEvent::Flushed(items) => self.flushed += items,
            StatsEvent::Requested => self.requests += 1,
            StatsEvent::Completed(ItemOutcome::Success) => self.indexed += 1,
            StatsEvent::Completed(ItemOutcome::Failure(_)) => self.failed += 1,
            StatsEvent::Completed(ItemOutcome::Pending) => {}
        }
    }
}

/// 🔍 A decoded line, or why it isn't one.
fn parse_line(line: &InputLine, target_index: Option<&str>) -> std::result::Result<BulkItem, String> {
    let record: RestoreLine = serde_json::from_slice(&line.bytes).map_err(|err| err.to_string())?;
    let index = target_index
        .map(str::to_string)
        .or(record.index)
        .ok_or_else(|| "no restore.index configured and the record has no _index".to_string())?;
    Ok(BulkItem {
        id: record.id,
        index,
        body: record.source,
        outcome: ItemOutcome::Pending,
    })
}

/// 🧵 One `_bulk` submitter. Buffers items into an NDJSON body, flushes on size or time.
#[derive(Debug)]
pub(crate) struct BulkWorker {
    worker_id: usize,
    cluster: Arc<dyn Cluster>,
    retry: RetryController,
    items: Receiver<BulkItem>,
    events: Sender<StatsEvent>,
    flush_bytes: usize,
    flush_interval: Duration,
}

/// 📦 What a worker has buffered but not yet sent.
#[derive(Debug, Default)]
struct PendingBody {
    body: String,
    items: Vec<BulkItem>,
}

impl Worker for BulkWorker {
    type Output = ();

    fn start(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}

impl BulkWorker {
    async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut pending = PendingBody::default();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                _ = ticker.tick() => {
                    if !pending.items.is_empty() {
                        debug!("⏰ worker {} flushing on the timer", self.worker_id);
                        self.flush(&mut pending, &cancel).await?;
                    }
                }
                next = self.items.recv() => match next {
                    Ok(item) => {
                        item.encode_into(&mut pending.body)?;
                        pending.items.push(item);
                        if pending.body.len() >= self.flush_bytes {
                            self.flush(&mut pending, &cancel).await?;
                            ticker.reset();
                        }
                    }
                    Err(_) => {
                        if !pending.items.is_empty() {
                            self.flush(&mut pending, &cancel).await?;
                        }
                        return Ok(());
                    }
                },
            }
        }
    }

    /// 🚚 Sends what's buffered. Only cancellation escapes as an error; everything else
    /// becomes per-item outcomes.
    async fn flush(&self, pending: &mut PendingBody, cancel: &CancellationToken) -> Result<()> {
        let body = std::mem::take(&mut pending.body);
        let mut items = std::mem::take(&mut pending.items);
        self.emit(StatsEvent::Flushed(items.len() as u64)).await;

        let cluster = &self.cluster;
        let body = body.as_str();
        let submitted = self
            .retry
            .attempt("bulk", 1, cancel, move |_| async move { cluster.bulk(body.to_string()).await })
            .await;

        match submitted {
            Ok(done) => {
                self.emit(StatsEvent::Requested).await;
                settle(&mut items, done.value);
            }
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!("⚠️ worker {}: _bulk with {} items failed for good: {err:#}", self.worker_id, items.len());
                let reason = format!("{err:#}");
                for item in &mut items {
                    item.outcome = ItemOutcome::Failure(reason.clone());
                }
            }
        }

        for item in items {
            if let ItemOutcome::Failure(reason) = &item.outcome {
                warn!("⚠️ failed to index '{}' into '{}': {reason}", item.label(), item.index);
            }
            self.emit(StatsEvent::Completed(item.outcome)).await;
        }
        Ok(())
    }

    async fn emit(&self, event: StatsEvent) {
        emit(&self.events, event).await;
    }
}

/// 📡 Hands one event to the stats task.
async fn emit(events: &Sender<StatsEvent>, event: StatsEvent) {
    // -- the stats task outlives the ingester and every worker, so a closed channel means teardown
    let _ = events.send(event).await;
}

/// 🎯 Pairs `_bulk` results with the items that produced them, by position.
fn settle(items: &mut [BulkItem], results: Vec<BulkItemResult>) {
    let answered = results.len();
    for (item, result) in items.iter_mut().zip(results) {
        item.outcome = if result.is_success() {
            ItemOutcome::Success
        } else {
            ItemOutcome::Failure(
                result
                    .error
                    .unwrap_or_else(|| format!("status {}", result.status)),
            )
        };
    }
    for item in items.iter_mut().skip(answered) {
        item.outcome = ItemOutcome::Failure("the cluster returned no result for this item".to_string());
    }
}

/// 📥 Turns lines into bulk items and keeps the worker pool fed.
#[derive(Debug)]
pub struct Ingester {
    cluster: Arc<dyn Cluster>,
    retry: RetryController,
    config: RestoreConfig,
}

impl Ingester {
    pub fn new(cluster: Arc<dyn Cluster>, app_config: &AppConfig) -> Self {
        let monitor = BackpressureMonitor::new(cluster.clone(), &app_config.backpressure);
        Self {
            retry: RetryController::new(&app_config.retry, monitor),
            cluster,
            config: app_config.restore.clone(),
        }
    }

    /// 🔄 Drains `lines`, then flushes every worker and returns the final stats.
    pub async fn ingest(self, lines: Receiver<InputLine>, cancel: CancellationToken) -> Result<RestoreStats> {
        let workers = self.config.workers.max(1);
        let (items_tx, items_rx) = async_channel::bounded::<BulkItem>(workers * 64);
        let (events_tx, events_rx) = async_channel::unbounded::<StatsEvent>();

        let stats_task = tokio::spawn(async move {
            let mut stats = RestoreStats::default();
            while let Ok(event) = events_rx.recv().await {
                stats.apply(event);
            }
            stats
        });

        let handles: Vec<JoinHandle<Result<()>>> = (0..workers)
            .map(|worker_id| {
                BulkWorker {
                    worker_id,
                    cluster: self.cluster.clone(),
                    retry: self.retry.clone(),
                    items: items_rx.clone(),
                    events: events_tx.clone(),
                    flush_bytes: self.config.flush_bytes.max(1),
                    flush_interval: Duration::from_secs(self.config.flush_interval_secs.max(1)),
                }
                .start(cancel.clone())
            })
            .collect();
        drop(items_rx);
        info!("🧵 restore started with {workers} bulk workers");

        let fed = self.feed(&lines, &items_tx, &events_tx, &cancel).await;
        // -- closing the item channel is how the workers learn to flush and go home
        drop(items_tx);
        if fed.is_err() {
            cancel.cancel();
        }

        let mut worker_failure = None;
        for joined in futures::future::join_all(handles).await {
            if let Err(err) = joined.context("💀 a bulk worker panicked").and_then(|result| result) {
                worker_failure.get_or_insert(err);
            }
        }
        drop(events_tx);
        let stats = stats_task.await.context("💀 the stats task panicked")?;

        fed?;
        if let Some(err) = worker_failure {
            return Err(err);
        }
        Ok(stats)
    }

    async fn feed(
        &self,
        lines: &Receiver<InputLine>,
        items: &Sender<BulkItem>,
        events: &Sender<StatsEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let target_index = self.config.index.as_deref();
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                line = lines.recv() => line,
            };
            let Ok(line) = line else {
                return Ok(());
            };

            match parse_line(&line, target_index) {
                Ok(item) => {
                    emit(events, StatsEvent::Added).await;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Cancelled.into()),
                        sent = items.send(item) => sent.map_err(|_| anyhow::anyhow!("💀 every bulk worker is gone"))?,
                    }
                }
                Err(reason) => {
                    warn!("⚠️ skipping {}:{}: {reason}", line.source, line.line_number);
                    emit(events, StatsEvent::Skipped).await;
                }
            }
        }
    }
}

/// 🚀 Reads the configured inputs and restores them. Reader failures are fatal, after the
/// workers have flushed what was already read.
pub async fn run_restore(cluster: Arc<dyn Cluster>, app_config: &AppConfig, cancel: CancellationToken) -> Result<RestoreStats> {
    let restore = &app_config.restore;
    let run_cancel = cancel.child_token();
    let (lines_tx, lines_rx) = async_channel::bounded(restore.workers.max(1) * 256);
    let reader = LineReader::new(InputSource::from_paths(&restore.inputs), restore.compressed, restore.validate_json)
        .spawn(lines_tx, run_cancel.clone());
    restore_from(cluster, app_config, reader, lines_rx, run_cancel).await
}

async fn restore_from(
    cluster: Arc<dyn Cluster>,
    app_config: &AppConfig,
    mut reader: JoinHandle<Result<ReaderSummary>>,
    lines: Receiver<InputLine>,
    run_cancel: CancellationToken,
) -> Result<RestoreStats> {
    let ingested = Ingester::new(cluster, app_config).ingest(lines, run_cancel.clone()).await;
    if ingested.is_err() {
        run_cancel.cancel();
    }

    // -- the reader only notices cancellation between lines. Parked in a read on an idle
    //    pipe, it never will, so a cancelled run stops waiting and leaves the thread behind.
    let read = tokio::select! {
        biased;
        read = &mut reader => read.context("💀 the input reader panicked")?,
        _ = run_cancel.cancelled() => {
            debug!("🛑 not waiting for the input reader, it's stuck in a read");
            return match ingested {
                Err(err) => Err(err),
                Ok(_) => Err(Cancelled.into()),
            };
        }
    };

    match (read, ingested) {
        (Ok(summary), Ok(mut stats)) => {
            stats.skipped += summary.rejected;
            info!(
                "✅ restore done: {} indexed, {} failed, {} skipped of {} lines",
                stats.indexed, stats.failed, stats.skipped, summary.lines + summary.rejected
            );
            Ok(stats)
        }
        (Err(read_err), Ok(stats)) => {
            Err(read_err.context(format!("💀 input failed after {} documents were indexed", stats.indexed)))
        }
        (Ok(_), Err(err)) => Err(err),
        (Err(read_err), Err(err)) => {
            if is_cancelled(&err) && !is_cancelled(&read_err) {
                Err(read_err)
            } else {
                Err(err)
            }
        }
    }
}
