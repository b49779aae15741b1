//! Standalone ranking worker.
//!
//! Runs the rank loader and merger against a directory-backed results bucket
//! and a JSON-snapshotted rank store. The snapshot is rewritten on its own
//! interval whenever the store changed, and once more on shutdown. The
//! indexer needs source control and symbol search services, so it is only
//! wired by embedders of [`coderank_index::RankingJobs`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

pub use coderank_config::RankingConfig;
pub use coderank_index as index;

use coderank_index::{
    spawn_periodic, LocalBucket, MemoryRankStore, PeriodicTask, RankingError, RankingJobs,
    ResultsBucket,
};

/// Environment variable naming an optional TOML configuration file.
pub const CONFIG_PATH_VAR: &str = "CODERANK_CONFIG";

const DEFAULT_LOG_FILTER: &str = "coderank=info,coderank_index=info";

/// Install the global tracing subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();
}

/// Writes the rank store snapshot when it has unsaved changes.
struct SnapshotTask {
    store: Arc<MemoryRankStore>,
    interval: Duration,
}

#[async_trait]
impl PeriodicTask for SnapshotTask {
    fn name(&self) -> &str {
        "rank-snapshot"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn handle(&self, _cancel: &CancellationToken) -> coderank_index::Result<()> {
        if self.store.save_if_changed().await.map_err(RankingError::Store)? {
            debug!("rank store snapshot written");
        }
        Ok(())
    }
}

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}

/// A running configuration plus the local store and bucket it operates on.
pub struct Worker {
    config: Arc<RankingConfig>,
    store: Arc<MemoryRankStore>,
    bucket: Arc<LocalBucket>,
}

impl Worker {
    /// Open the rank store snapshot and results bucket named by `config.worker`.
    pub fn open(config: RankingConfig) -> Result<Self> {
        let store_path = config.worker.store_path();
        let store = MemoryRankStore::open(&store_path)
            .with_context(|| format!("Failed to open rank store {:?}", store_path))?;

        let bucket_name = config.results_bucket().unwrap_or("local").to_string();
        let bucket = LocalBucket::new(bucket_name, config.worker.bucket_root());

        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            bucket: Arc::new(bucket),
        })
    }

    pub fn store(&self) -> &Arc<MemoryRankStore> {
        &self.store
    }

    fn jobs(&self) -> RankingJobs {
        let bucket: Arc<dyn ResultsBucket> = self.bucket.clone();
        RankingJobs::new(self.config.clone(), self.store.clone()).with_bucket(bucket)
    }

    /// Run the background tasks until `shutdown` completes, then stop them and
    /// save the store snapshot.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        if !self.config.enabled {
            warn!("ranking is disabled; tasks will idle until enabled");
        }
        info!(
            bucket = self.bucket.name(),
            root = ?self.bucket.root(),
            graph_key = %self.config.loader.results_graph_key,
            "starting ranking worker"
        );

        let cancel = CancellationToken::new();
        let mut handles = self.jobs().spawn(&cancel);
        let snapshot = SnapshotTask {
            store: self.store.clone(),
            interval: Duration::from_secs(self.config.worker.snapshot_interval_secs),
        };
        handles.push(spawn_periodic(Arc::new(snapshot), cancel.clone()));

        shutdown.await;
        info!("shutting down ranking worker");
        cancel.cancel();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!("ranking task ended abnormally: {}", e);
            }
        }

        self.store.save().await?;
        Ok(())
    }
}

/// Entry point of the `coderank` binary.
pub async fn run() -> Result<()> {
    init_tracing();

    let config_path = std::env::var_os(CONFIG_PATH_VAR).map(PathBuf::from);
    let config = RankingConfig::load(config_path.as_deref())
        .context("Failed to load ranking configuration")?;

    Worker::open(config)?.run_until(shutdown_signal()).await
}
