//! 🎬 *[camera pans across a dimly lit server room]*
//! 🎬 "In a world where workers toil endlessly..."
//! 🎬 "One supervisor dared to manage them all."
//! 🎬 *[record scratch]* 🦆
//!
//! 📦 Dump supervision. Two roles, one queue, one cancellation token:
//!
//! ```text
//! Exporter ──▶ bounded queue (capacity C) ──▶ RecordWriter ──▶ sinks
//!     ▲                                             │
//!     └──────────── BatchPool (free list) ◀─────────┘
//! ```
//!
//! Whichever role fails first cancels the other. The first failure is the one reported; the
//! sibling's "I was cancelled" is just noise at that point.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::app_config::{AppConfig, DumpConfig};
use crate::backends::Cluster;
use crate::backpressure::BackpressureMonitor;
use crate::common::{BatchPool, HitBatch};
use crate::error::is_cancelled;
use crate::exporter::{DumpSummary, Exporter};
use crate::progress::ProgressMetrics;
use crate::retry::RetryController;
use crate::sinks::SinkBackend;
use crate::writer::{RecordWriter, WriterSummary};

/// 🏗️ A background worker, that does work. duh.
///
/// The supervisor hands every worker the run's token; the worker owns everything else.
pub(crate) trait Worker {
    type Output: Send + 'static;

    fn start(self, cancel: CancellationToken) -> JoinHandle<Result<Self::Output>>;
}

/// 🚰 The exporter plus the sending end of the queue.
#[derive(Debug)]
pub(crate) struct SourceWorker {
    exporter: Exporter,
    tx: Sender<HitBatch>,
}

impl Worker for SourceWorker {
    type Output = DumpSummary;

    fn start(self, cancel: CancellationToken) -> JoinHandle<Result<DumpSummary>> {
        tokio::spawn(self.exporter.run(self.tx, cancel))
    }
}

impl Worker for RecordWriter {
    type Output = WriterSummary;

    fn start(self, cancel: CancellationToken) -> JoinHandle<Result<WriterSummary>> {
        tokio::spawn(self.run(cancel))
    }
}

/// 📊 Both halves of a finished dump.
#[derive(Debug, Clone)]
pub struct DumpReport {
    pub export: DumpSummary,
    pub written: WriterSummary,
}

#[derive(Debug)]
pub struct DumpSupervisor {
    cluster: Arc<dyn Cluster>,
    config: DumpConfig,
    index: String,
    retry: RetryController,
}

impl DumpSupervisor {
    pub fn new(cluster: Arc<dyn Cluster>, app_config: &AppConfig) -> Result<Self> {
        let index = app_config
            .dump
            .index
            .clone()
            .context("💀 a dump needs an index. Set dump.index or pass --index.")?;
        let monitor = BackpressureMonitor::new(cluster.clone(), &app_config.backpressure);
        let retry = RetryController::new(&app_config.retry, monitor);
        Ok(Self {
            cluster,
            config: app_config.dump.clone(),
            index,
            retry,
        })
    }

    /// 🧵 Starts both roles and waits for both to stop.
    pub async fn run(self, sinks: Vec<SinkBackend>, cancel: CancellationToken) -> Result<DumpReport> {
        let capacity = self.config.queue_capacity.max(1);
        let (tx, rx) = async_channel::bounded(capacity);
        // -- ♻️ C in the queue, one being filled, one being written
        let pool = BatchPool::new(capacity + 2);

        let progress = if self.config.progress {
            ProgressMetrics::new(self.index.clone())
        } else {
            ProgressMetrics::hidden(self.index.clone())
        };
        let exporter = Exporter::new(
            self.cluster,
            self.retry,
            self.index,
            self.config.paging,
            self.config.page_size,
            self.config.keep_alive,
            pool.clone(),
        )
        .with_progress(progress);

        let run_cancel = cancel.child_token();
        let producer = SourceWorker { exporter, tx }.start(run_cancel.clone());
        let consumer = RecordWriter::new(rx, pool, sinks).start(run_cancel.clone());
        debug!("🧵 dump roles started, queue capacity {capacity}");

        supervise(producer, consumer, run_cancel).await
    }
}

fn joined<T>(joined: std::result::Result<Result<T>, tokio::task::JoinError>, role: &str) -> Result<T> {
    joined.with_context(|| format!("💀 the {role} task panicked or was aborted"))?
}

/// 👀 Waits for whichever role finishes first. A failure cancels the sibling, then the
/// sibling is awaited anyway so nothing outlives the run.
async fn supervise(
    mut producer: JoinHandle<Result<DumpSummary>>,
    mut consumer: JoinHandle<Result<WriterSummary>>,
    cancel: CancellationToken,
) -> Result<DumpReport> {
    let (export, written, writer_finished_first) = tokio::select! {
        exported = &mut producer => {
            let exported = joined(exported, "exporter");
            if exported.is_err() {
                cancel.cancel();
            }
            (exported, joined(consumer.await, "writer"), false)
        }
        written = &mut consumer => {
            let written = joined(written, "writer");
            if written.is_err() {
                cancel.cancel();
            }
            (joined(producer.await, "exporter"), written, true)
        }
    };

    match (export, written) {
        (Ok(export), Ok(written)) => Ok(DumpReport { export, written }),
        (Err(err), Ok(_)) | (Ok(_), Err(err)) => Err(err),
        (Err(exporter_err), Err(writer_err)) => {
            let (first, fallout) = if writer_finished_first {
                (writer_err, exporter_err)
            } else {
                (exporter_err, writer_err)
            };
            // -- a real failure beats the cancellation it caused
            let (primary, fallout) = if is_cancelled(&first) && !is_cancelled(&fallout) {
                (fallout, first)
            } else {
                (first, fallout)
            };
            warn!("⚠️ the other role stopped too: {fallout:#}");
            Err(primary)
        }
    }
}
