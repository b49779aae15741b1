//! Periodic per-repository ranking pass.
//!
//! For each repository the rank store knows about, the indexer builds the file
//! reference graph of its head snapshot, ranks it and writes the result back.

use std::sync::Arc;
use std::time::Instant;

use coderank_config::RankingConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RankingError, Result};
use crate::graph_builder::FileReferenceGraphBuilder;
use crate::pagerank::PageRanker;
use crate::source::{Repo, SourceControl, SymbolSearch};
use crate::store::RankStore;

/// Statistics about an indexing pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexStats {
    /// Repositories whose document ranks were written
    pub repos_indexed: usize,
    /// Of those, repositories with nothing to rank (no head, no references)
    pub repos_empty: usize,
    /// Paths ranked across all repositories
    pub paths_ranked: usize,
    /// Total time in milliseconds
    pub duration_ms: u64,
}

/// Builds, ranks and persists document ranks for every known repository.
pub struct RepositoryIndexer {
    config: Arc<RankingConfig>,
    store: Arc<dyn RankStore>,
    builder: FileReferenceGraphBuilder,
    ranker: PageRanker,
}

impl RepositoryIndexer {
    pub fn new(
        config: Arc<RankingConfig>,
        store: Arc<dyn RankStore>,
        source: Arc<dyn SourceControl>,
        search: Arc<dyn SymbolSearch>,
    ) -> Self {
        let builder = FileReferenceGraphBuilder::new(source, search, config.indexer.clone());
        Self {
            config,
            store,
            builder,
            ranker: PageRanker::default(),
        }
    }

    /// Use non-default PageRank parameters.
    pub fn with_ranker(mut self, ranker: PageRanker) -> Self {
        self.ranker = ranker;
        self
    }

    /// Index every repository, stopping at the first failure.
    pub async fn index_all(&self, cancel: &CancellationToken) -> Result<IndexStats> {
        if !self.config.enabled {
            debug!("ranking disabled, skipping repository indexing");
            return Ok(IndexStats::default());
        }

        let start = Instant::now();
        let repos = self.store.repositories().await.map_err(RankingError::Store)?;
        info!("Starting ranking pass over {} repositories", repos.len());

        let mut stats = IndexStats::default();
        for repo in &repos {
            if cancel.is_cancelled() {
                return Err(RankingError::Cancelled);
            }

            let paths = self.index_repository(repo, cancel).await?;
            stats.repos_indexed += 1;
            stats.paths_ranked += paths;
            if paths == 0 {
                stats.repos_empty += 1;
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!("Ranking pass complete: {:?}", stats);
        Ok(stats)
    }

    /// Rank one repository and return the number of paths written.
    ///
    /// The stored ranks are always replaced, so a repository that lost its
    /// head or its references ends up with an empty rank map.
    pub async fn index_repository(&self, repo: &Repo, cancel: &CancellationToken) -> Result<usize> {
        let graph = self.builder.build(&repo.name, cancel).await?;
        let ranks = self.ranker.rank(cancel, graph).await?.document_ranks();

        self.store
            .set_document_ranks(&repo.name, &ranks)
            .await
            .map_err(RankingError::Store)?;

        debug!(repo = %repo.name, paths = ranks.len(), "stored document ranks");
        Ok(ranks.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ArchiveOptions, CommitId, Symbol};
    use crate::store::MemoryRankStore;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::{Cursor, Read};

    fn tar_of(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, body.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    /// Repository name -> (archive, symbols). Unknown repositories have no head.
    #[derive(Default)]
    struct FakeHost {
        repos: HashMap<String, (Vec<u8>, Vec<Symbol>)>,
        broken: Option<String>,
    }

    #[async_trait]
    impl SourceControl for FakeHost {
        async fn resolve_head(&self, repo: &str) -> anyhow::Result<Option<CommitId>> {
            if self.broken.as_deref() == Some(repo) {
                return Err(anyhow!("gitserver unavailable for {repo}"));
            }
            Ok(self.repos.get(repo).map(|_| CommitId("c0ffee".into())))
        }

        async fn archive_reader(
            &self,
            repo: &str,
            _options: &ArchiveOptions,
        ) -> anyhow::Result<Box<dyn Read + Send>> {
            let (archive, _) = self.repos.get(repo).ok_or_else(|| anyhow!("no repo {repo}"))?;
            Ok(Box::new(Cursor::new(archive.clone())))
        }
    }

    #[async_trait]
    impl SymbolSearch for FakeHost {
        async fn search(
            &self,
            repo: &str,
            _commit: &CommitId,
            _first: usize,
        ) -> anyhow::Result<Vec<Symbol>> {
            Ok(self.repos.get(repo).map(|(_, s)| s.clone()).unwrap_or_default())
        }
    }

    fn go_repo() -> (Vec<u8>, Vec<Symbol>) {
        (
            tar_of(&[
                ("foo.go", "func Foo()"),
                ("bar.go", "func Bar() { Foo() }"),
                ("baz.go", "func Baz() { Bar(); Foo() }"),
            ]),
            vec![
                Symbol::new("Foo", "foo.go"),
                Symbol::new("Bar", "bar.go"),
                Symbol::new("Baz", "baz.go"),
            ],
        )
    }

    fn enabled() -> Arc<RankingConfig> {
        let mut config = RankingConfig::default();
        config.enabled = true;
        Arc::new(config)
    }

    fn indexer(config: Arc<RankingConfig>, store: Arc<MemoryRankStore>, host: FakeHost) -> RepositoryIndexer {
        let host = Arc::new(host);
        RepositoryIndexer::new(config, store, host.clone(), host)
    }

    #[tokio::test]
    async fn test_index_all_stores_ranks() {
        let store = Arc::new(MemoryRankStore::new());
        store.add_repo(Repo::new(1, "github.com/acme/go")).await.unwrap();
        store.add_repo(Repo::new(2, "github.com/acme/empty")).await.unwrap();

        let mut host = FakeHost::default();
        host.repos.insert("github.com/acme/go".into(), go_repo());

        let stats = indexer(enabled(), store.clone(), host)
            .index_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.repos_indexed, 2);
        assert_eq!(stats.repos_empty, 1);
        assert_eq!(stats.paths_ranked, 3);

        let ranks = store
            .get_document_ranks("github.com/acme/go")
            .await
            .unwrap()
            .unwrap();
        // Stored ranks are inverted: the most referenced file has the smallest value.
        assert!(ranks["foo.go"] < ranks["bar.go"]);
        assert!(ranks["bar.go"] < ranks["baz.go"]);
        assert!(store
            .get_document_ranks("github.com/acme/empty")
            .await
            .unwrap()
            .unwrap()
            .is_empty());
        assert!(store.last_updated_at(&[1]).await.unwrap().contains_key(&1));
    }

    #[tokio::test]
    async fn test_lost_head_clears_stale_ranks() {
        let store = Arc::new(MemoryRankStore::new());
        store.add_repo(Repo::new(1, "github.com/acme/go")).await.unwrap();
        let cancel = CancellationToken::new();

        let mut host = FakeHost::default();
        host.repos.insert("github.com/acme/go".into(), go_repo());
        indexer(enabled(), store.clone(), host)
            .index_all(&cancel)
            .await
            .unwrap();
        let before = store.get_document_ranks("github.com/acme/go").await.unwrap().unwrap();
        assert_eq!(before.len(), 3);

        // Same repository, but the code host no longer resolves a head.
        let stats = indexer(enabled(), store.clone(), FakeHost::default())
            .index_all(&cancel)
            .await
            .unwrap();
        assert_eq!(stats.repos_empty, 1);
        let after = store.get_document_ranks("github.com/acme/go").await.unwrap().unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_is_noop() {
        let store = Arc::new(MemoryRankStore::new());
        store.add_repo(Repo::new(1, "github.com/acme/go")).await.unwrap();
        let mut host = FakeHost::default();
        host.repos.insert("github.com/acme/go".into(), go_repo());

        let stats = indexer(Arc::new(RankingConfig::default()), store.clone(), host)
            .index_all(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats, IndexStats::default());
        assert!(store.get_document_ranks("github.com/acme/go").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failure_aborts_pass() {
        let store = Arc::new(MemoryRankStore::new());
        store.add_repo(Repo::new(1, "github.com/acme/broken")).await.unwrap();
        store.add_repo(Repo::new(2, "github.com/acme/go")).await.unwrap();

        let mut host = FakeHost::default();
        host.repos.insert("github.com/acme/go".into(), go_repo());
        host.broken = Some("github.com/acme/broken".into());

        let err = indexer(enabled(), store.clone(), host)
            .index_all(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RankingError::SourceControl(_)));
        // Repositories are visited in name order, so the healthy one was never reached.
        assert!(store.get_document_ranks("github.com/acme/go").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let store = Arc::new(MemoryRankStore::new());
        store.add_repo(Repo::new(1, "github.com/acme/go")).await.unwrap();
        let mut host = FakeHost::default();
        host.repos.insert("github.com/acme/go".into(), go_repo());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = indexer(enabled(), store, host).index_all(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
