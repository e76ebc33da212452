//! 🚀 jlx-cli: the front door, the bouncer, the maitre d' of jlx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that parses flags, loads config,
//! sets up logging, wires Ctrl-C to a cancellation token, and then lets the real code
//! do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// 📤📥 Dump an index to NDJSON. Restore NDJSON into an index. That's the whole job.
#[derive(Debug, Parser)]
#[command(name = "jlx", version, about)]
struct Cli {
    /// TOML config file. Flags beat the file, the file beats `JLX_*` env vars.
    #[arg(long, short = 'c', global = true, env = "JLX_CONFIG")]
    config: Option<PathBuf>,

    /// Cluster URL, scheme and port included.
    #[arg(long, global = true)]
    url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// 📤 Write every document of an index as one JSON line.
    Dump(DumpArgs),
    /// 📥 Bulk-index NDJSON lines from files (or stdin).
    Restore(RestoreArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Paging {
    Pit,
    Scroll,
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// Index, alias or pattern to dump.
    #[arg(long, short = 'i')]
    index: Option<String>,

    #[arg(long)]
    page_size: Option<usize>,

    #[arg(long, value_enum)]
    paging: Option<Paging>,

    /// Throw the lines away. Handy for measuring read throughput.
    #[arg(long)]
    null: bool,

    /// Write to stdout. The default when no other sink is given.
    #[arg(long)]
    stdout: bool,

    /// Write to a file (truncated). Repeatable.
    #[arg(long = "file", short = 'o')]
    files: Vec<PathBuf>,

    /// No progress bar.
    #[arg(long)]
    quiet: bool,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    /// Send everything to this index instead of each record's `_index`.
    #[arg(long, short = 'i')]
    index: Option<String>,

    /// Concurrent `_bulk` workers.
    #[arg(long, short = 'w')]
    workers: Option<usize>,

    /// Reject lines that aren't JSON objects before they reach the cluster.
    #[arg(long)]
    validate_json: bool,

    /// Inputs are gzip.
    #[arg(long, short = 'z')]
    compressed: bool,

    /// NDJSON files, read in order. None means stdin.
    inputs: Vec<PathBuf>,
}

fn insert_if(section: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        section.insert(key.to_string(), value);
    }
}

/// 🧩 Only the flags the user actually typed, shaped like `AppConfig`, so the merge
/// never stomps the file with defaults.
fn overrides(cli: &Cli) -> Value {
    let mut root = Map::new();
    if let Some(url) = &cli.url {
        root.insert("cluster".into(), json!({ "url": url }));
    }

    match &cli.command {
        Command::Dump(args) => {
            let mut dump = Map::new();
            insert_if(&mut dump, "index", args.index.clone().map(Value::from));
            insert_if(&mut dump, "page_size", args.page_size.map(Value::from));
            insert_if(
                &mut dump,
                "paging",
                args.paging.map(|paging| match paging {
                    Paging::Pit => json!("point_in_time"),
                    Paging::Scroll => json!("scroll"),
                }),
            );
            let mut sinks = Vec::new();
            if args.null {
                sinks.push(json!({ "kind": "discard" }));
            }
            if args.stdout {
                sinks.push(json!({ "kind": "stdout" }));
            }
            sinks.extend(args.files.iter().map(|path| json!({ "kind": "file", "path": path })));
            if !sinks.is_empty() {
                dump.insert("sinks".into(), Value::Array(sinks));
            }
            if args.quiet {
                dump.insert("progress".into(), json!(false));
            }
            root.insert("dump".into(), Value::Object(dump));
        }
        Command::Restore(args) => {
            let mut restore = Map::new();
            insert_if(&mut restore, "index", args.index.clone().map(Value::from));
            insert_if(&mut restore, "workers", args.workers.map(Value::from));
            if args.validate_json {
                restore.insert("validate_json".into(), json!(true));
            }
            if args.compressed {
                restore.insert("compressed".into(), json!(true));
            }
            if !args.inputs.is_empty() {
                restore.insert("inputs".into(), json!(args.inputs));
            }
            root.insert("restore".into(), Value::Object(restore));
        }
    }
    Value::Object(root)
}

/// 🔊 `RUST_LOG` when it says something, INFO when it doesn't. Skipped lines, failed items
/// and retries are warnings, and a silent default would swallow every one of them.
fn log_filter(rust_log: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(rust_log)
}

/// 🛑 First Ctrl-C cancels the run. The run then unwinds on its own.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("🛑 Ctrl-C: cancelling, flushing what's already in flight");
            on_signal.cancel();
        }
    });
    cancel
}

async fn run(cli: Cli) -> Result<()> {
    let app_config = jlx::app_config::load_config(cli.config.as_deref(), overrides(&cli))
        .context("💀 In jlx-cli, main, we couldn't load the config. Check the file, the JLX_* env vars and the flags.")?;
    let cancel = cancel_on_ctrl_c();

    match cli.command {
        Command::Dump(_) => {
            jlx::dump(app_config, cancel).await?;
        }
        Command::Restore(_) => {
            let stats = jlx::restore(app_config, cancel).await?;
            // -- 📊 stats on stdout, logs on stderr. pipe-friendly.
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }
    Ok(())
}

/// 🚀 main(): where it all begins. The genesis. The big bang.
///
/// 🔧 Steps:
/// 1. Init tracing (to stderr, stdout might be the dump)
/// 2. Parse flags
/// 3. Load config and run the verb
/// 4. Handle errors (cry)
#[tokio::main]
async fn main() {
    // 📡 Set up tracing, because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(&std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one tear-jerking layer at a time
        let mut the_vibes_are_giving_connection_issues = false;
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
            let cause_str = cause.to_string();
            if cause_str.contains("error sending request")
                || cause_str.contains("connection refused")
                || cause_str.contains("Connection refused")
                || cause_str.contains("tcp connect error")
                || cause_str.contains("dns error")
            {
                the_vibes_are_giving_connection_issues = true;
            }
        }

        // -- 📡 if it smells like a connection problem, it's probably a connection problem
        if the_vibes_are_giving_connection_issues {
            error!(
                "🔧 hint: looks like the cluster isn't reachable. \
                Double-check the URL and that Elasticsearch is actually running. \
                If you're using Docker, try `docker ps` to see what's up. ☕"
            );
        }

        // 🗑️ Exit with prejudice. Process exitus maximus.
        std::process::exit(1);
    }
}
