//! Periodic background tasks: indexer, loader and merger.
//!
//! Each task runs on its own timer and finishes one pass before the next tick
//! is considered. Failures are logged and retried on the following tick.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coderank_config::RankingConfig;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bucket::ResultsBucket;
use crate::error::Result;
use crate::indexer::RepositoryIndexer;
use crate::loader::RankLoader;
use crate::source::{SourceControl, SymbolSearch};
use crate::store::RankStore;

/// A unit of background work invoked on a fixed interval.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    /// Run one pass. Long passes should check `cancel` between units of work.
    async fn handle(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Run `task` every `task.interval()` until `cancel` fires.
///
/// The first pass starts immediately.
pub fn spawn_periodic(task: Arc<dyn PeriodicTask>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(task.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = task.name(), interval = ?task.interval(), "periodic task started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match task.handle(&cancel).await {
                        Ok(()) => {}
                        Err(err) if err.is_cancelled() => break,
                        Err(err) => error!(task = task.name(), "periodic task failed: {err}"),
                    }
                }
            }
        }

        debug!(task = task.name(), "periodic task stopped");
    })
}

struct IndexerTask {
    indexer: RepositoryIndexer,
    interval: Duration,
}

#[async_trait]
impl PeriodicTask for IndexerTask {
    fn name(&self) -> &str {
        "rank-indexer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn handle(&self, cancel: &CancellationToken) -> Result<()> {
        self.indexer.index_all(cancel).await.map(|_| ())
    }
}

struct LoaderTask {
    loader: Arc<RankLoader>,
    interval: Duration,
}

#[async_trait]
impl PeriodicTask for LoaderTask {
    fn name(&self) -> &str {
        "rank-loader"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn handle(&self, cancel: &CancellationToken) -> Result<()> {
        self.loader.load_ranks(cancel).await.map(|_| ())
    }
}

struct MergerTask {
    loader: Arc<RankLoader>,
    interval: Duration,
}

#[async_trait]
impl PeriodicTask for MergerTask {
    fn name(&self) -> &str {
        "rank-merger"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn handle(&self, _cancel: &CancellationToken) -> Result<()> {
        self.loader.merge_ranks().await.map(|_| ())
    }
}

/// Wires the ranking background tasks from configuration and collaborators.
///
/// The loader and merger are always available. The indexer needs source
/// control and symbol search and is only created once both are supplied.
pub struct RankingJobs {
    config: Arc<RankingConfig>,
    store: Arc<dyn RankStore>,
    bucket: Option<Arc<dyn ResultsBucket>>,
    source: Option<(Arc<dyn SourceControl>, Arc<dyn SymbolSearch>)>,
}

impl RankingJobs {
    pub fn new(config: Arc<RankingConfig>, store: Arc<dyn RankStore>) -> Self {
        Self {
            config,
            store,
            bucket: None,
            source: None,
        }
    }

    pub fn with_bucket(mut self, bucket: Arc<dyn ResultsBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn SourceControl>, search: Arc<dyn SymbolSearch>) -> Self {
        self.source = Some((source, search));
        self
    }

    /// The configured tasks, indexer first when present.
    pub fn tasks(&self) -> Vec<Arc<dyn PeriodicTask>> {
        let mut tasks: Vec<Arc<dyn PeriodicTask>> = Vec::new();

        if let Some((source, search)) = &self.source {
            tasks.push(Arc::new(IndexerTask {
                indexer: RepositoryIndexer::new(
                    self.config.clone(),
                    self.store.clone(),
                    source.clone(),
                    search.clone(),
                ),
                interval: Duration::from_secs(self.config.indexer.interval_secs),
            }));
        }

        let loader = Arc::new(RankLoader::new(
            self.config.clone(),
            self.store.clone(),
            self.bucket.clone(),
        ));
        tasks.push(Arc::new(LoaderTask {
            loader: loader.clone(),
            interval: Duration::from_secs(self.config.loader.interval_secs),
        }));
        tasks.push(Arc::new(MergerTask {
            loader,
            interval: Duration::from_secs(self.config.merger.interval_secs),
        }));

        tasks
    }

    /// Spawn every task; all of them stop when `cancel` fires.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.tasks()
            .into_iter()
            .map(|task| spawn_periodic(task, cancel.clone()))
            .collect()
    }
}
