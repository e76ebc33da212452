//! 🚰 Sinks: where dump lines go to live out the rest of their lives.
//!
//! The writer encodes a whole page into one buffer, then hands the same bytes to every
//! configured sink. Stdout for piping, a file for keeping, discard for benchmarking the
//! cluster without benchmarking your disk. Pick any combination; each gets every line.
//!
//! 🧠 Knowledge graph:
//! - [`Sink`]: the trait: `write` a chunk, `close` when done.
//! - [`SinkBackend`]: enum dispatch over the concrete sinks, no `dyn` needed.
//! - [`SinkConfig`]: what the config file says, turned into a backend by [`SinkBackend::open`].
//!
//! 🦆 (mandatory, no notes)

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt, BufWriter};
use tracing::trace;

/// 📐 One entry of `dump.sinks`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    /// 🕳️ Swallow everything. Great for measuring read throughput.
    Discard,
    Stdout,
    /// 📂 Truncates on open. No append mode, no backup, no mercy.
    File { path: PathBuf },
}

/// 🕳️ A sink that consumes encoded lines.
///
/// `close()` exists because buffered sinks need a moment to flush before the run ends.
#[async_trait]
pub trait Sink: std::fmt::Debug + Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct DiscardSink {
    discarded: u64,
}

#[async_trait]
impl Sink for DiscardSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.discarded += chunk.len() as u64;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        trace!("🕳️ discard sink swallowed {} bytes without complaint", self.discarded);
        Ok(())
    }
}

#[derive(Debug)]
pub struct StdoutSink {
    out: BufWriter<io::Stdout>,
}

impl StdoutSink {
    pub(crate) fn new() -> Self {
        Self {
            out: BufWriter::new(io::stdout()),
        }
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.out
            .write_all(chunk)
            .await
            .context("💀 stdout stopped listening. Was the pipe closed on the other end?")
    }

    async fn close(&mut self) -> Result<()> {
        self.out.flush().await.context("💀 final flush to stdout failed")
    }
}

/// 📂 BufWriter around a tokio `File`. One syscall per document is a war crime.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file_buf: BufWriter<File>,
}

impl FileSink {
    pub(crate) async fn create(path: PathBuf) -> Result<Self> {
        let file_handle = File::create(&path).await.with_context(|| {
            format!(
                "💀 The sink file '{}' could not be conjured into existence. \
                 Does the parent directory exist? Do we have permission to write there?",
                path.display()
            )
        })?;
        Ok(Self {
            path,
            file_buf: BufWriter::new(file_handle),
        })
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file_buf
            .write_all(chunk)
            .await
            .with_context(|| format!("💀 writing to '{}' failed. Disk full? It's always disk full.", self.path.display()))
    }

    async fn close(&mut self) -> Result<()> {
        // -- async Drop isn't a thing, so the last bytes only land if we flush by hand
        self.file_buf
            .flush()
            .await
            .with_context(|| format!("💀 final flush of '{}' failed. The bytes never made it.", self.path.display()))
    }
}

/// 📦 A sink that never forgets. Tests peek inside through the shared buffer.
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct InMemorySink {
    pub(crate) received: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
    pub(crate) closed: std::sync::Arc<std::sync::atomic::AtomicBool>,
    /// 💥 When set, every write fails. For testing what a dying sink does to a run.
    pub(crate) broken: bool,
}

#[cfg(test)]
impl InMemorySink {
    pub(crate) fn lines(&self) -> Vec<String> {
        let received = self.received.lock().unwrap_or_else(|p| p.into_inner());
        String::from_utf8_lossy(&received).lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
#[async_trait]
impl Sink for InMemorySink {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        anyhow::ensure!(!self.broken, "💀 scripted sink failure");
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend_from_slice(chunk);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub enum SinkBackend {
    Discard(DiscardSink),
    Stdout(StdoutSink),
    File(FileSink),
    #[cfg(test)]
    InMemory(InMemorySink),
}

impl SinkBackend {
    /// 🚀 Opens the sink a config entry describes. Files are created (and truncated) here.
    pub async fn open(config: &SinkConfig) -> Result<Self> {
        Ok(match config {
            SinkConfig::Discard => SinkBackend::Discard(DiscardSink::default()),
            SinkConfig::Stdout => SinkBackend::Stdout(StdoutSink::new()),
            SinkConfig::File { path } => SinkBackend::File(FileSink::create(path.clone()).await?),
        })
    }

    /// Opens every configured sink, in order. Nothing configured means stdout.
    pub async fn open_all(configs: &[SinkConfig]) -> Result<Vec<Self>> {
        if configs.is_empty() {
            return Ok(vec![SinkBackend::Stdout(StdoutSink::new())]);
        }
        let mut sinks = Vec::with_capacity(configs.len());
        for config in configs {
            sinks.push(Self::open(config).await?);
        }
        Ok(sinks)
    }
}

#[async_trait]
impl Sink for SinkBackend {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            SinkBackend::Discard(sink) => sink.write(chunk).await,
            SinkBackend::Stdout(sink) => sink.write(chunk).await,
            SinkBackend::File(sink) => sink.write(chunk).await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.write(chunk).await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            SinkBackend::Discard(sink) => sink.close().await,
            SinkBackend::Stdout(sink) => sink.close().await,
            SinkBackend::File(sink) => sink.close().await,
            #[cfg(test)]
            SinkBackend::InMemory(sink) => sink.close().await,
        }
    }
}
