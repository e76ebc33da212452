//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." said every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Layers, weakest first: serde defaults → `JLX_*` env vars → TOML file → CLI flags.
//! Nested keys in env vars use a double underscore: `JLX_DUMP__PAGE_SIZE=500`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backends::ClusterConfig;
use crate::backpressure::BackpressureConfig;
use crate::cursor::PagingMode;
use crate::retry::RetryConfig;
use crate::sinks::SinkConfig;

/// 📦 The AppConfig: one struct to rule them all, built once in `main()` and passed down.
/// No globals. Nobody reaches around the back to grab a client.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub backpressure: BackpressureConfig,
}

/// 📤 Knobs for `jlx dump`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DumpConfig {
    /// Index (or alias, or pattern) to read. Required for a dump.
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 🚧 Pages allowed to sit between exporter and writer before the exporter blocks.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub paging: PagingMode,
    /// ⏱️ Cursor lease, renewed on every page. Elasticsearch time units.
    #[serde(default = "default_keep_alive")]
    pub keep_alive: String,
    /// Empty means stdout.
    #[serde(default)]
    pub sinks: Vec<SinkConfig>,
    #[serde(default = "default_progress")]
    pub progress: bool,
}

fn default_page_size() -> usize {
    1000
}

fn default_queue_capacity() -> usize {
    4
}

fn default_keep_alive() -> String {
    "5m".to_string()
}

fn default_progress() -> bool {
    true
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            index: None,
            page_size: default_page_size(),
            queue_capacity: default_queue_capacity(),
            paging: PagingMode::default(),
            keep_alive: default_keep_alive(),
            sinks: Vec::new(),
            progress: default_progress(),
        }
    }
}

/// 📥 Knobs for `jlx restore`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RestoreConfig {
    /// Target index. Unset means every record goes back where its `_index` says.
    #[serde(default)]
    pub index: Option<String>,
    /// Files read in order. Empty means stdin.
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// 🧵 Concurrent `_bulk` submitters.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// 📏 A worker flushes once its pending body reaches this many bytes.
    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,
    /// Reject non-object lines at the reader, with file and line number.
    #[serde(default)]
    pub validate_json: bool,
    /// 🫁 Inputs are gzip.
    #[serde(default)]
    pub compressed: bool,
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn default_flush_interval_secs() -> u64 {
    30
}

// -- 📏 5 MiB. elasticsearch's own docs suggest starting around here for bulk bodies.
fn default_flush_bytes() -> usize {
    5 * 1024 * 1024
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            index: None,
            inputs: Vec::new(),
            workers: default_workers(),
            flush_interval_secs: default_flush_interval_secs(),
            flush_bytes: default_flush_bytes(),
            validate_json: false,
            compressed: false,
        }
    }
}

impl AppConfig {
    /// ✅ Catches the knobs that would otherwise fail somewhere deep and confusing.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.dump.page_size >= 1, "💀 dump.page_size must be at least 1");
        ensure!(self.dump.queue_capacity >= 1, "💀 dump.queue_capacity must be at least 1");
        ensure!(!self.dump.keep_alive.trim().is_empty(), "💀 dump.keep_alive can't be blank");
        ensure!(self.restore.workers >= 1, "💀 restore.workers must be at least 1");
        ensure!(self.restore.flush_bytes >= 1, "💀 restore.flush_bytes must be at least 1");
        ensure!(
            self.restore.flush_interval_secs >= 1,
            "💀 restore.flush_interval_secs must be at least 1"
        );
        ensure!(self.retry.max_attempts >= 1, "💀 retry.max_attempts must be at least 1");
        ensure!(
            self.backpressure.poll_interval_secs >= 1,
            "💀 backpressure.poll_interval_secs must be at least 1"
        );
        Ok(())
    }
}

/// 🚀 Load the config: from a file, from env vars, from CLI flags, or from the sheer power of hoping.
///
/// 📐 Tribal knowledge:
///   - `config_file_name` None → env vars and flags only. No implicit `jlx.toml` lookup.
///   - `config_file_name` Some → the file must parse; a missing file is just an empty layer.
///   - `overrides` should serialize only the fields the user actually set, or it will stomp
///     the file with defaults.
///
/// 💀 Errors say which layer we were reading, because "error: error" helps nobody.
pub fn load_config(config_file_name: Option<&Path>, overrides: impl Serialize) -> Result<AppConfig> {
    info!("🔧 Loading configuration: {:?}", config_file_name.unwrap_or(Path::new("<none>")));

    let config = Figment::new().merge(Env::prefixed("JLX_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };
    let config = config.merge(Serialized::defaults(overrides));

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from '{}', JLX_* environment variables and flags.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from JLX_* environment variables and flags. \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}
