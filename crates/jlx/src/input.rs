//! 📂 Previously, on "Things That Could Go Wrong With A File"...
//!
//! The disk was quiet. Too quiet. A lone thread had been tasked with reading a dump back in.
//! Just a file, they said. The file was gzipped. The file was four files. The file was stdin,
//! piped from a `curl` that died halfway. And somewhere, a line was growing to 1MB because
//! someone forgot the newline at the end of their NDJSON.
//!
//! 🚰 files / stdin → (gzip?) → lines → `async_channel` → the restore ingester
//!
//! Reading is blocking I/O, so it runs on tokio's blocking pool and pushes lines into the
//! channel with `send_blocking`. A full channel parks the thread, which is exactly the
//! backpressure we want. Open and read failures are fatal. A line that fails validation is not.
//!
//! 🦆 (mandatory, no notes)

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::Sender;
use flate2::read::MultiGzDecoder;
use serde::de::IgnoredAny;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Cancelled;

/// 📄 One line of input, with enough breadcrumbs to complain about it precisely.
#[derive(Debug, Clone)]
pub struct InputLine {
    pub source: Arc<str>,
    /// 1-based.
    pub line_number: u64,
    pub bytes: Vec<u8>,
}

/// 📥 Where restore reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    Stdin,
    File(PathBuf),
}

impl InputSource {
    /// Files in order, or stdin when there are none.
    pub fn from_paths(paths: &[PathBuf]) -> Vec<Self> {
        if paths.is_empty() {
            return vec![InputSource::Stdin];
        }
        paths.iter().cloned().map(InputSource::File).collect()
    }

    fn name(&self) -> Arc<str> {
        match self {
            InputSource::Stdin => Arc::from("<stdin>"),
            InputSource::File(path) => Arc::from(path.display().to_string()),
        }
    }

    fn open(&self, compressed: bool) -> Result<Box<dyn BufRead>> {
        let raw: Box<dyn io::Read> = match self {
            InputSource::Stdin => Box::new(io::stdin().lock()),
            InputSource::File(path) => Box::new(
                File::open(path)
                    .with_context(|| format!("💀 couldn't open input '{}'. Typo? Permissions?", path.display()))?,
            ),
        };
        if compressed {
            // -- MultiGz so concatenated gzip members (`cat a.gz b.gz`) read as one stream
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(BufReader::new(raw)))))
        } else {
            Ok(Box::new(BufReader::new(raw)))
        }
    }
}

/// 📊 What the reader saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderSummary {
    pub lines: u64,
    /// Lines refused by `validate_json`.
    pub rejected: u64,
}

#[derive(Debug, Clone)]
pub struct LineReader {
    sources: Vec<InputSource>,
    compressed: bool,
    validate_json: bool,
}

impl LineReader {
    pub fn new(sources: Vec<InputSource>, compressed: bool, validate_json: bool) -> Self {
        Self {
            sources,
            compressed,
            validate_json,
        }
    }

    /// 🧵 Reads every source on the blocking pool. The channel closes when the reader is done.
    pub fn spawn(self, tx: Sender<InputLine>, cancel: CancellationToken) -> JoinHandle<Result<ReaderSummary>> {
        tokio::task::spawn_blocking(move || self.read_all(&tx, &cancel))
    }

    fn read_all(&self, tx: &Sender<InputLine>, cancel: &CancellationToken) -> Result<ReaderSummary> {
        let mut summary = ReaderSummary::default();
        for source in &self.sources {
            let name = source.name();
            let mut reader = source.open(self.compressed)?;
            debug!("📂 reading '{name}'");
            let mut line_number = 0u64;
            let mut line = Vec::new();
            while read_line(reader.as_mut(), &mut line).with_context(|| format!("💀 reading '{name}' failed"))? {
                line_number += 1;
                if cancel.is_cancelled() {
                    return Err(Cancelled.into());
                }
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if self.validate_json {
                    if let Err(reason) = validate_object(&line) {
                        warn!("⚠️ {name}:{line_number} isn't a JSON object, skipping: {reason}");
                        summary.rejected += 1;
                        continue;
                    }
                }
                summary.lines += 1;
                let input = InputLine {
                    source: name.clone(),
                    line_number,
                    bytes: std::mem::take(&mut line),
                };
                if tx.send_blocking(input).is_err() {
                    // -- the ingester is gone, which only happens when the run is being torn down
                    return Err(Cancelled.into());
                }
            }
        }
        Ok(summary)
    }
}

/// ✂️ Reads up to the next `\n` (dropped, along with a trailing `\r`). False at end of input.
fn read_line(reader: &mut dyn BufRead, line: &mut Vec<u8>) -> io::Result<bool> {
    line.clear();
    let mut saw_anything = false;
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        if available.is_empty() {
            break;
        }
        saw_anything = true;
        match memchr::memchr(b'\n', available) {
            Some(newline) => {
                line.extend_from_slice(&available[..newline]);
                reader.consume(newline + 1);
                break;
            }
            None => {
                let taken = available.len();
                line.extend_from_slice(available);
                reader.consume(taken);
            }
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(saw_anything)
}

/// ✅ Well-formed JSON whose top level is an object.
fn validate_object(line: &[u8]) -> std::result::Result<(), String> {
    let first = line.iter().find(|b| !b.is_ascii_whitespace());
    if first != Some(&b'{') {
        return Err("top level is not an object".to_string());
    }
    serde_json::from_slice::<IgnoredAny>(line)
        .map(|_| ())
        .map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    async fn collect(reader: LineReader) -> Result<(ReaderSummary, Vec<InputLine>)> {
        let (tx, rx) = async_channel::bounded(16);
        let handle = reader.spawn(tx, CancellationToken::new());
        let mut lines = Vec::new();
        while let Ok(line) = rx.recv().await {
            lines.push(line);
        }
        Ok((handle.await??, lines))
    }

    fn text(line: &InputLine) -> &str {
        std::str::from_utf8(&line.bytes).expect("utf8")
    }

    #[test]
    fn the_one_where_crlf_and_a_missing_final_newline_both_behave() -> Result<()> {
        let mut reader = io::Cursor::new(b"{\"a\":1}\r\n\n{\"b\":2}".to_vec());
        let mut line = Vec::new();
        let mut seen = Vec::new();
        while read_line(&mut reader, &mut line)? {
            seen.push(String::from_utf8(line.clone())?);
        }
        assert_eq!(seen, vec!["{\"a\":1}", "", "{\"b\":2}"]);
        Ok(())
    }

    #[test]
    fn the_one_where_validation_wants_an_object_and_nothing_less() {
        assert!(validate_object(br#" {"_id":"1"}"#).is_ok());
        assert!(validate_object(b"[1,2]").is_err());
        assert!(validate_object(br#"{"_id":"1""#).is_err());
    }

    #[tokio::test]
    async fn the_one_where_files_are_read_in_order_and_blank_lines_vanish() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("a.ndjson");
        let second = dir.path().join("b.ndjson");
        std::fs::write(&first, "{\"n\":1}\n\n{\"n\":2}\n")?;
        std::fs::write(&second, "{\"n\":3}\n")?;

        let reader = LineReader::new(InputSource::from_paths(&[first.clone(), second]), false, false);
        let (summary, lines) = collect(reader).await?;

        assert_eq!(lines.iter().map(text).collect::<Vec<_>>(), vec!["{\"n\":1}", "{\"n\":2}", "{\"n\":3}"]);
        assert_eq!(lines[1].line_number, 3, "line numbers count the blank line too");
        assert_eq!(&*lines[0].source, first.display().to_string());
        assert_eq!(summary.lines, 3);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_gzip_is_peeled_transparently() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.ndjson.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"n\":1}\n{\"n\":2}\n")?;
        std::fs::write(&path, encoder.finish()?)?;

        let (summary, lines) = collect(LineReader::new(vec![InputSource::File(path)], true, false)).await?;
        assert_eq!(summary.lines, 2);
        assert_eq!(text(&lines[1]), "{\"n\":2}");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_validation_drops_the_bad_line_and_keeps_going() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mixed.ndjson");
        std::fs::write(&path, "{\"n\":1}\nnot json\n{\"n\":2}\n")?;

        let (summary, lines) = collect(LineReader::new(vec![InputSource::File(path)], false, true)).await?;
        assert_eq!(summary, ReaderSummary { lines: 2, rejected: 1 });
        assert_eq!(lines.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_missing_file_is_fatal() {
        let reader = LineReader::new(vec![InputSource::File(PathBuf::from("/definitely/not/here.ndjson"))], false, false);
        let err = collect(reader).await.expect_err("missing input");
        assert!(format!("{err:#}").contains("couldn't open input"));
    }
}
