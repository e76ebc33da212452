//! ✍️ The record writer: consumer half of a dump.
//!
//! Pulls pages off the queue in order, turns each hit into one `{"_id","_index","_source"}`
//! line, and fans the bytes out to every sink. The sort key never makes it into the output;
//! `DumpLine` doesn't have a field for it.
//!
//! ♻️ Every batch goes back to the pool the moment its bytes are encoded, so the producer
//! can reuse the buffer for a page that hasn't been fetched yet.

use anyhow::{Context, Result};
use async_channel::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::common::{BatchPool, HitBatch, encode_line};
use crate::error::Cancelled;
use crate::sinks::{Sink, SinkBackend};

/// 📊 What the writer pushed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub docs: u64,
    pub bytes: u64,
    pub batches: u64,
}

#[derive(Debug)]
pub struct RecordWriter {
    rx: Receiver<HitBatch>,
    pool: BatchPool,
    sinks: Vec<SinkBackend>,
    line_buf: Vec<u8>,
}

impl RecordWriter {
    pub fn new(rx: Receiver<HitBatch>, pool: BatchPool, sinks: Vec<SinkBackend>) -> Self {
        Self {
            rx,
            pool,
            sinks,
            line_buf: Vec::new(),
        }
    }

    /// 🔄 Drains the queue until the exporter hangs up, then flushes and closes every sink.
    ///
    /// A cancelled run skips the final flush: whatever already reached the sinks stays there.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WriterSummary> {
        let mut summary = WriterSummary::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Cancelled.into()),
                next = self.rx.recv() => next,
            };
            let Ok(batch) = next else {
                break;
            };
            let written = self.write_batch(batch).await?;
            summary.docs += written.0;
            summary.bytes += written.1;
            summary.batches += 1;
        }

        for sink in &mut self.sinks {
            sink.close().await.context("💀 a sink refused to close cleanly")?;
        }
        debug!("✅ writer done: {} docs, {} bytes", summary.docs, summary.bytes);
        Ok(summary)
    }

    async fn write_batch(&mut self, batch: HitBatch) -> Result<(u64, u64)> {
        self.line_buf.clear();
        for hit in &batch.hits {
            encode_line(hit, &mut self.line_buf)?;
        }
        let docs = batch.len() as u64;
        trace!("📬 page {} encoded: {} docs, {} bytes", batch.page_number, docs, self.line_buf.len());
        self.pool.give_back(batch);

        for sink in &mut self.sinks {
            sink.write(&self.line_buf).await?;
        }
        Ok((docs, self.line_buf.len() as u64))
    }
}
