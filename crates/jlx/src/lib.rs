//! 🚀 jlx: dump an index to NDJSON lines, restore NDJSON lines into an index.
//!
//! 🎬 Two verbs, one cluster, one very stubborn retry loop.
//!
//! 🧠 Knowledge graph:
//! - [`dump`]: exporter → bounded queue → record writer → sinks, see [`supervisor`]
//! - [`restore`]: input files → ingester → bulk workers → `_bulk`, see [`restore`](mod@restore)
//! - everything talks to the cluster through [`backends::Cluster`]
//! - everything that retries goes through [`retry::RetryController`], which waits on
//!   [`backpressure::BackpressureMonitor`] when the breakers are hot
//!
//! 🦆 The duck is load-bearing. Do not remove the duck.

use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod app_config;
pub mod backends;
pub mod backpressure;
pub mod common;
pub mod cursor;
pub mod error;
pub mod exporter;
pub mod input;
pub(crate) mod progress;
pub mod restore;
pub mod retry;
pub mod sinks;
pub mod supervisor;
pub mod writer;

use crate::app_config::AppConfig;
use crate::backends::elasticsearch::supports_shard_doc;
use crate::backends::{Cluster, ElasticsearchCluster};
use crate::cursor::PagingMode;
use crate::restore::{RestoreStats, run_restore};
use crate::sinks::SinkBackend;
use crate::supervisor::{DumpReport, DumpSupervisor};

/// 📡 Builds the client and says hello before any real work starts. `needs_shard_doc` is
/// set for point-in-time dumps, which older clusters can't sort.
async fn connect(app_config: &AppConfig, needs_shard_doc: bool) -> Result<Arc<dyn Cluster>> {
    let cluster = ElasticsearchCluster::new(app_config.cluster.clone())
        .context("💀 couldn't build a client for the cluster")?;
    let version = cluster.ping().await?;
    if let Some(version) = version {
        ensure!(
            !needs_shard_doc || supports_shard_doc(&version),
            "💀 point-in-time paging sorts on _shard_doc, which Elasticsearch {version} doesn't have (7.12+). \
             Use `--paging scroll` (dump.paging = \"scroll\") on this cluster."
        );
    }
    Ok(Arc::new(cluster))
}

/// 📤 Dumps `dump.index` to every configured sink.
pub async fn dump(app_config: AppConfig, cancel: CancellationToken) -> Result<DumpReport> {
    let cluster = connect(&app_config, app_config.dump.paging == PagingMode::PointInTime).await?;
    let supervisor = DumpSupervisor::new(cluster, &app_config)?;
    let sinks = SinkBackend::open_all(&app_config.dump.sinks).await?;
    info!("🚀 dumping from {}", app_config.cluster.url);
    let report = supervisor.run(sinks, cancel).await.context("💀 the dump did not finish")?;
    info!(
        "✅ dump finished: {} docs in {} pages ({:?})",
        report.written.docs, report.export.pages, report.export.termination
    );
    Ok(report)
}

/// 📥 Restores the configured inputs (or stdin) into the cluster.
pub async fn restore(app_config: AppConfig, cancel: CancellationToken) -> Result<RestoreStats> {
    let cluster = connect(&app_config, false).await?;
    info!("🚀 restoring into {}", app_config.cluster.url);
    run_restore(cluster, &app_config, cancel)
        .await
        .context("💀 the restore did not finish")
}
