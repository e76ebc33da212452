//! 📊 progress.rs: "Are we there yet?", every dump, every time, forever.
//!
//! 🚀 Docs fetched vs. docs the cluster claims to have, how fast they're moving, and a guess
//! at how long until the heat death of this export. Rendered on stderr, so stdout stays
//! pristine for records.
//!
//! ⚠️ The total is whatever `_count` said at the start. If the index grows mid-dump the bar
//! happily goes past 100%. The bar is not the termination signal. Nothing here is.
//!
//! 🦆 The duck has nothing to do with this module. It's just vibing.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 📏 one mebibyte: not a megabyte, pedants. there's a difference and I will die on this hill.
const MIB: f64 = 1024.0 * 1024.0;

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS for the long hauls. Order pizza. Plural.
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// 📡 Throughput over the sliding window.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Rates {
    docs_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Tracks docs and bytes for one dump and paints them onto an indicatif bar.
///
/// Rates come from a 5-second sliding window so one slow page doesn't look like the end
/// of the world. (It might be. The window just won't tell you yet.)
pub(crate) struct ProgressMetrics {
    index_name: String,
    /// 📏 from `_count`. 0 means "no idea", which disables percent and ETA.
    expected_docs: u64,
    total_docs: u64,
    total_bytes: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- 🎭 ProgressBar is a diva and doesn't derive Debug
        f.debug_struct("ProgressMetrics")
            .field("index_name", &self.index_name)
            .field("expected_docs", &self.expected_docs)
            .field("total_docs", &self.total_docs)
            .field("total_bytes", &self.total_bytes)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 A visible bar on stderr.
    pub(crate) fn new(index_name: String) -> Self {
        let progress_bar = ProgressBar::new(0);
        // -- 🎨 cyan because it's classy, blue because it's calm
        let style = ProgressStyle::default_bar()
            .template("{msg}\n| [{bar:40.cyan/blue}]")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        progress_bar.set_style(style);
        Self::with_bar(index_name, progress_bar)
    }

    /// 🙈 Same bookkeeping, nothing drawn. For `dump.progress = false` and for tests.
    pub(crate) fn hidden(index_name: String) -> Self {
        Self::with_bar(index_name, ProgressBar::hidden())
    }

    fn with_bar(index_name: String, progress_bar: ProgressBar) -> Self {
        let start_time = Instant::now();
        // -- 🔄 seed the window with t=0 so we don't divide by zero like animals
        let mut rate_samples = VecDeque::new();
        rate_samples.push_back((start_time, 0u64, 0u64));
        Self {
            index_name,
            expected_docs: 0,
            total_docs: 0,
            total_bytes: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔢 What `_count` said. Call once, before the first page.
    pub(crate) fn set_expected(&mut self, expected_docs: u64) {
        self.expected_docs = expected_docs;
        self.progress_bar.set_length(expected_docs);
    }

    /// 🔄 One page landed.
    pub(crate) fn update(&mut self, docs: u64, bytes: u64) {
        self.total_docs += docs;
        self.total_bytes += bytes;
        let rates = self.calculate_rates(Instant::now());
        self.render(rates);
        self.progress_bar.set_position(self.total_docs.min(self.expected_docs));
    }

    pub(crate) fn total_docs(&self) -> u64 {
        self.total_docs
    }

    /// ✅ Ring the bell. We made it. (Or we hit the last page. Same energy.)
    pub(crate) fn finish(&self) {
        self.progress_bar.finish();
    }

    fn percent(&self) -> f64 {
        if self.expected_docs == 0 {
            return 0.0;
        }
        (self.total_docs as f64 / self.expected_docs as f64) * 100.0
    }

    fn calculate_rates(&mut self, now: Instant) -> Rates {
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.total_docs, self.total_bytes));

        match self.rate_samples.front() {
            Some(&(oldest_time, oldest_docs, oldest_bytes)) => {
                let elapsed = now.duration_since(oldest_time).as_secs_f64();
                if elapsed <= 0.0 {
                    return Rates::default();
                }
                Rates {
                    docs_per_sec: self.total_docs.saturating_sub(oldest_docs) as f64 / elapsed,
                    mib_per_sec: self.total_bytes.saturating_sub(oldest_bytes) as f64 / elapsed / MIB,
                }
            }
            None => Rates::default(),
        }
    }

    /// 🔮 Linear extrapolation. Assumes the future looks like the past, which historically
    /// is a bad assumption but fine for a progress bar.
    fn remaining(&self, elapsed: Duration) -> String {
        let percent = self.percent();
        if percent <= 0.0 || percent >= 100.0 {
            return "--:--".to_string();
        }
        let total_estimated = elapsed.as_secs_f64() / (percent / 100.0);
        let remaining_secs = total_estimated - elapsed.as_secs_f64();
        if remaining_secs > 0.0 {
            format_duration(Duration::from_secs_f64(remaining_secs))
        } else {
            "--:--".to_string()
        }
    }

    /// 🎨 Layout (3 rows x 2 cols, no borders):
    /// ```text
    /// | index: <name>
    /// | [=====>----------]
    ///   <docs/s>     <docs> / <expected>
    ///   <MiB/s>      <%>
    ///   <elapsed>    <remaining>
    /// ```
    fn render(&self, rates: Rates) {
        let elapsed = self.start_time.elapsed();
        let expected = if self.expected_docs > 0 {
            format_number(self.expected_docs)
        } else {
            "?".to_string()
        };

        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Docs/s", format_number(rates.docs_per_sec as u64))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} / {} Docs", format_number(self.total_docs), expected))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec)).set_alignment(CellAlignment::Right),
            Cell::new(format!("{:.2}%", self.percent())).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(elapsed))).set_alignment(CellAlignment::Right),
            Cell::new(format!("{} remaining", self.remaining(elapsed))).set_alignment(CellAlignment::Right),
        ]);

        self.progress_bar
            .set_message(format!("index: {}\n{}", self.index_name, table));
    }
}
