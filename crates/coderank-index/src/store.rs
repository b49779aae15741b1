//! Rank store interface and an in-process implementation.
//!
//! The rank store is the only durable owner of ranks. Production deployments
//! back [`RankStore`] with a database; [`MemoryRankStore`] keeps everything in
//! memory and can snapshot itself to a JSON file, which is enough for the
//! standalone worker and for tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::pagerank::DocumentRanks;
use crate::source::Repo;

/// Repository name -> path -> rank vector, one bulk rank file's worth of rows.
pub type BulkRanks = HashMap<String, HashMap<String, Vec<f64>>>;

/// One generation of ranking computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphKey {
    pub key: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of one merge batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Distinct repositories whose ranks changed
    pub repos_updated: usize,
    /// Bulk rows consumed
    pub rows_processed: usize,
}

/// Durable keyed storage for repository and document ranks.
///
/// Implementations must be safe to call concurrently from the indexer, loader
/// and merger; each method is its own unit of work.
#[async_trait]
pub trait RankStore: Send + Sync {
    /// Every repository that should be indexed.
    async fn repositories(&self) -> Result<Vec<Repo>>;

    /// Star-derived rank of a repository, 0 when unknown.
    async fn get_star_rank(&self, repo: &str) -> Result<f64>;

    /// Raw per-path ranks, `None` when the repository has none stored.
    async fn get_document_ranks(&self, repo: &str) -> Result<Option<HashMap<String, f64>>>;

    /// Global mean log reference count used to calibrate document ranks.
    async fn get_reference_count_statistics(&self) -> Result<f64>;

    /// Replace the document ranks of one repository.
    async fn set_document_ranks(&self, repo: &str, ranks: &DocumentRanks) -> Result<()>;

    /// Subset of `names` already ingested under `graph_key`.
    async fn has_input_filename(&self, graph_key: &str, names: &[String]) -> Result<Vec<String>>;

    /// Queue the rows of one input object and record its name as ingested.
    async fn bulk_set_document_ranks(
        &self,
        graph_key: &str,
        object_name: &str,
        ranks: &BulkRanks,
    ) -> Result<()>;

    /// Move up to `batch_size` queued rows into the queryable rank table.
    async fn merge_document_ranks(&self, graph_key: &str, batch_size: usize) -> Result<MergeStats>;

    /// Current ranking generation, if one has been started.
    async fn derivative_graph_key(&self) -> Result<Option<GraphKey>>;

    /// Start a new ranking generation.
    async fn bump_derivative_graph_key(&self) -> Result<GraphKey>;

    /// When the document ranks of each repository id last changed.
    async fn last_updated_at(&self, repo_ids: &[i32]) -> Result<HashMap<i32, DateTime<Utc>>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RepoRecord {
    id: i32,
    star_rank: f64,
    document_ranks: Option<HashMap<String, Vec<f64>>>,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRow {
    repo: String,
    path: String,
    rank: Vec<f64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    repos: BTreeMap<String, RepoRecord>,
    /// graph key -> ingested object names
    input_filenames: HashMap<String, BTreeSet<String>>,
    /// graph key -> rows waiting to be merged
    pending: HashMap<String, VecDeque<PendingRow>>,
    graph_key: Option<GraphKey>,
    /// Id handed to the next auto-created repository
    #[serde(default)]
    next_id: i32,
    #[serde(skip)]
    bulk_writes: usize,
    /// Bumped on every mutation
    #[serde(skip)]
    revision: u64,
}

impl StoreState {
    /// Record for `name`, created with the next free id if missing.
    fn repo_mut(&mut self, name: &str) -> &mut RepoRecord {
        let next_id = &mut self.next_id;
        self.repos.entry(name.to_string()).or_insert_with(|| {
            *next_id = (*next_id).max(1);
            let id = *next_id;
            *next_id += 1;
            RepoRecord {
                id,
                ..RepoRecord::default()
            }
        })
    }

    /// Ensure auto-assigned ids stay above every id in use.
    fn reserve_ids(&mut self) {
        let max_id = self.repos.values().map(|r| r.id).max().unwrap_or(0);
        self.next_id = self.next_id.max(max_id + 1);
    }
}

/// In-memory [`RankStore`] with optional JSON snapshot persistence.
#[derive(Debug, Default)]
pub struct MemoryRankStore {
    state: RwLock<StoreState>,
    snapshot_path: Option<PathBuf>,
    /// Revision captured by the last successful save
    saved_revision: AtomicU64,
}

impl MemoryRankStore {
    /// Create an empty, non-persistent store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a store backed by `path`, loading the snapshot if it exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let state = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read rank store snapshot {:?}", path))?;
            let mut state: StoreState = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse rank store snapshot {:?}", path))?;
            state.reserve_ids();
            info!("Loaded rank store with {} repositories from {:?}", state.repos.len(), path);
            state
        } else {
            info!("No rank store snapshot at {:?}, starting empty", path);
            StoreState::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot_path: Some(path.to_path_buf()),
            saved_revision: AtomicU64::new(0),
        })
    }

    /// Write the snapshot to disk. A no-op for non-persistent stores.
    pub async fn save(&self) -> Result<()> {
        let Some(path) = self.snapshot_path.clone() else {
            return Ok(());
        };

        let (json, revision) = {
            let state = self.state.read().await;
            let json =
                serde_json::to_string_pretty(&*state).context("Failed to serialize rank store")?;
            (json, state.revision)
        };

        tokio::task::spawn_blocking(move || write_snapshot(&path, &json)).await??;
        self.saved_revision.store(revision, Ordering::SeqCst);
        Ok(())
    }

    /// Save only when something changed since the last save. Returns whether
    /// a snapshot was written.
    pub async fn save_if_changed(&self) -> Result<bool> {
        if self.snapshot_path.is_none() || !self.has_unsaved_changes().await {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    /// Whether the in-memory state differs from the last snapshot.
    pub async fn has_unsaved_changes(&self) -> bool {
        self.state.read().await.revision != self.saved_revision.load(Ordering::SeqCst)
    }

    /// Register a repository under a fixed id.
    ///
    /// Fails when another repository already holds `repo.id`.
    pub async fn add_repo(&self, repo: Repo) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some((holder, _)) = state
            .repos
            .iter()
            .find(|(name, record)| record.id == repo.id && **name != repo.name)
        {
            bail!("repository id {} already belongs to {}", repo.id, holder);
        }

        state.repo_mut(&repo.name).id = repo.id;
        state.reserve_ids();
        state.revision += 1;
        Ok(())
    }

    pub async fn set_star_rank(&self, repo: &str, rank: f64) {
        let mut state = self.state.write().await;
        state.repo_mut(repo).star_rank = rank;
        state.revision += 1;
    }

    /// Rows bulk-written under `graph_key` and not yet merged.
    pub async fn pending_rows(&self, graph_key: &str) -> usize {
        self.state
            .read()
            .await
            .pending
            .get(graph_key)
            .map_or(0, VecDeque::len)
    }

    /// Number of bulk writes accepted since this store was created or opened.
    pub async fn bulk_write_count(&self) -> usize {
        self.state.read().await.bulk_writes
    }
}

#[async_trait]
impl RankStore for MemoryRankStore {
    async fn repositories(&self) -> Result<Vec<Repo>> {
        let state = self.state.read().await;
        Ok(state
            .repos
            .iter()
            .map(|(name, record)| Repo::new(record.id, name.clone()))
            .collect())
    }

    async fn get_star_rank(&self, repo: &str) -> Result<f64> {
        let state = self.state.read().await;
        Ok(state.repos.get(repo).map_or(0.0, |r| r.star_rank))
    }

    async fn get_document_ranks(&self, repo: &str) -> Result<Option<HashMap<String, f64>>> {
        let state = self.state.read().await;
        Ok(state
            .repos
            .get(repo)
            .and_then(|r| r.document_ranks.as_ref())
            .map(|ranks| {
                ranks
                    .iter()
                    .map(|(path, rank)| (path.clone(), rank.first().copied().unwrap_or(0.0)))
                    .collect()
            }))
    }

    async fn get_reference_count_statistics(&self) -> Result<f64> {
        let state = self.state.read().await;
        let logs: Vec<f64> = state
            .repos
            .values()
            .filter_map(|r| r.document_ranks.as_ref())
            .flat_map(|ranks| ranks.values())
            .filter_map(|rank| rank.first().copied())
            .filter(|rank| *rank > 0.0)
            .map(f64::log2)
            .collect();

        if logs.is_empty() {
            return Ok(0.0);
        }
        Ok(logs.iter().sum::<f64>() / logs.len() as f64)
    }

    async fn set_document_ranks(&self, repo: &str, ranks: &DocumentRanks) -> Result<()> {
        let mut state = self.state.write().await;
        let record = state.repo_mut(repo);
        record.document_ranks = Some(ranks.clone());
        record.updated_at = Some(Utc::now());
        state.revision += 1;
        Ok(())
    }

    async fn has_input_filename(&self, graph_key: &str, names: &[String]) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let Some(seen) = state.input_filenames.get(graph_key) else {
            return Ok(Vec::new());
        };
        Ok(names.iter().filter(|n| seen.contains(*n)).cloned().collect())
    }

    async fn bulk_set_document_ranks(
        &self,
        graph_key: &str,
        object_name: &str,
        ranks: &BulkRanks,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let newly_seen = state
            .input_filenames
            .entry(graph_key.to_string())
            .or_default()
            .insert(object_name.to_string());
        if !newly_seen {
            debug!(graph_key, object = object_name, "input already ingested, ignoring");
            return Ok(());
        }

        let queue = state.pending.entry(graph_key.to_string()).or_default();
        let mut repos: Vec<_> = ranks.iter().collect();
        repos.sort_by(|a, b| a.0.cmp(b.0));
        for (repo, paths) in repos {
            for (path, rank) in paths {
                queue.push_back(PendingRow {
                    repo: repo.clone(),
                    path: path.clone(),
                    rank: rank.clone(),
                });
            }
        }
        state.bulk_writes += 1;
        state.revision += 1;
        Ok(())
    }

    async fn merge_document_ranks(&self, graph_key: &str, batch_size: usize) -> Result<MergeStats> {
        let mut state = self.state.write().await;
        let batch: Vec<PendingRow> = match state.pending.get_mut(graph_key) {
            Some(queue) => {
                let n = batch_size.min(queue.len());
                queue.drain(..n).collect()
            }
            None => return Ok(MergeStats::default()),
        };
        if batch.is_empty() {
            return Ok(MergeStats::default());
        }

        let now = Utc::now();
        let mut touched = BTreeSet::new();
        for row in &batch {
            let record = state.repo_mut(&row.repo);
            record
                .document_ranks
                .get_or_insert_with(HashMap::new)
                .insert(row.path.clone(), row.rank.clone());
            record.updated_at = Some(now);
            touched.insert(row.repo.clone());
        }
        state.revision += 1;

        Ok(MergeStats {
            repos_updated: touched.len(),
            rows_processed: batch.len(),
        })
    }

    async fn derivative_graph_key(&self) -> Result<Option<GraphKey>> {
        Ok(self.state.read().await.graph_key.clone())
    }

    async fn bump_derivative_graph_key(&self) -> Result<GraphKey> {
        let mut state = self.state.write().await;
        let created_at = Utc::now();
        let key = GraphKey {
            key: format!("{}", created_at.timestamp_millis()),
            created_at,
        };
        state.graph_key = Some(key.clone());
        state.revision += 1;
        Ok(key)
    }

    async fn last_updated_at(&self, repo_ids: &[i32]) -> Result<HashMap<i32, DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state
            .repos
            .values()
            .filter(|r| repo_ids.contains(&r.id))
            .filter_map(|r| r.updated_at.map(|at| (r.id, at)))
            .collect())
    }
}

fn write_snapshot(path: &Path, json: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;

    debug!("Saved rank store snapshot to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn bulk(rows: &[(&str, &str, f64)]) -> BulkRanks {
        let mut ranks = BulkRanks::new();
        for (repo, path, rank) in rows {
            ranks
                .entry(repo.to_string())
                .or_default()
                .insert(path.to_string(), vec![*rank]);
        }
        ranks
    }

    #[tokio::test]
    async fn test_unknown_repo_has_no_ranks() {
        let store = MemoryRankStore::new();
        assert_eq!(store.get_star_rank("nope").await.unwrap(), 0.0);
        assert!(store.get_document_ranks("nope").await.unwrap().is_none());
        assert_eq!(store.get_reference_count_statistics().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_set_and_get_document_ranks() {
        let store = MemoryRankStore::new();
        store.add_repo(Repo::new(7, "github.com/a/b")).await.unwrap();

        let mut ranks = DocumentRanks::new();
        ranks.insert("main.go".into(), vec![4.0]);
        ranks.insert("empty.go".into(), vec![]);
        store.set_document_ranks("github.com/a/b", &ranks).await.unwrap();

        let stored = store.get_document_ranks("github.com/a/b").await.unwrap().unwrap();
        assert_eq!(stored["main.go"], 4.0);
        assert_eq!(stored["empty.go"], 0.0);

        let updated = store.last_updated_at(&[7, 8]).await.unwrap();
        assert!(updated.contains_key(&7));
        assert!(!updated.contains_key(&8));
    }

    #[tokio::test]
    async fn test_input_filenames_scoped_by_graph_key() {
        let store = MemoryRankStore::new();
        store
            .bulk_set_document_ranks("k1", "ranks/a.csv", &bulk(&[("r", "p", 1.0)]))
            .await
            .unwrap();

        let names = vec!["ranks/a.csv".to_string(), "ranks/b.csv".to_string()];
        assert_eq!(store.has_input_filename("k1", &names).await.unwrap(), vec!["ranks/a.csv"]);
        assert!(store.has_input_filename("k2", &names).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_bulk_write_ignored() {
        let store = MemoryRankStore::new();
        let rows = bulk(&[("r", "p", 1.0)]);
        store.bulk_set_document_ranks("k", "o", &rows).await.unwrap();
        store.bulk_set_document_ranks("k", "o", &rows).await.unwrap();

        assert_eq!(store.bulk_write_count().await, 1);
        assert_eq!(store.pending_rows("k").await, 1);
    }

    #[tokio::test]
    async fn test_merge_makes_forward_progress() {
        let store = MemoryRankStore::new();
        let rows = bulk(&[
            ("r1", "a.go", 1.0),
            ("r1", "b.go", 2.0),
            ("r2", "c.go", 3.0),
        ]);
        store.bulk_set_document_ranks("k", "o", &rows).await.unwrap();

        let first = store.merge_document_ranks("k", 2).await.unwrap();
        assert_eq!(first.rows_processed, 2);
        assert_eq!(first.repos_updated, 1);

        let second = store.merge_document_ranks("k", 2).await.unwrap();
        assert_eq!(second.rows_processed, 1);
        assert_eq!(second.repos_updated, 1);

        let done = store.merge_document_ranks("k", 2).await.unwrap();
        assert_eq!(done, MergeStats::default());

        let r1 = store.get_document_ranks("r1").await.unwrap().unwrap();
        assert_eq!(r1.len(), 2);
        let r2 = store.get_document_ranks("r2").await.unwrap().unwrap();
        assert_eq!(r2["c.go"], 3.0);
    }

    #[tokio::test]
    async fn test_reference_count_statistics() {
        let store = MemoryRankStore::new();
        let mut ranks = DocumentRanks::new();
        ranks.insert("a".into(), vec![2.0]);
        ranks.insert("b".into(), vec![8.0]);
        ranks.insert("c".into(), vec![0.0]);
        store.set_document_ranks("r", &ranks).await.unwrap();

        // mean(log2(2), log2(8)) = 2
        assert_eq!(store.get_reference_count_statistics().await.unwrap(), 2.0);
    }

    #[tokio::test]
    async fn test_graph_key_bump() {
        let store = MemoryRankStore::new();
        assert!(store.derivative_graph_key().await.unwrap().is_none());

        let key = store.bump_derivative_graph_key().await.unwrap();
        assert_eq!(store.derivative_graph_key().await.unwrap(), Some(key));
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ranks.json");

        let store = MemoryRankStore::open(&path).unwrap();
        store.add_repo(Repo::new(3, "github.com/x/y")).await.unwrap();
        store.set_star_rank("github.com/x/y", 0.5).await;
        store
            .bulk_set_document_ranks("k", "ranks/0.csv", &bulk(&[("github.com/x/y", "a", 1.0)]))
            .await
            .unwrap();
        store.save().await.unwrap();

        let reopened = MemoryRankStore::open(&path).unwrap();
        assert_eq!(reopened.get_star_rank("github.com/x/y").await.unwrap(), 0.5);
        assert_eq!(reopened.repositories().await.unwrap(), vec![Repo::new(3, "github.com/x/y")]);
        assert_eq!(
            reopened
                .has_input_filename("k", &["ranks/0.csv".to_string()])
                .await
                .unwrap(),
            vec!["ranks/0.csv"]
        );
        assert_eq!(reopened.pending_rows("k").await, 1);
    }

    #[tokio::test]
    async fn test_auto_ids_skip_registered_ids() {
        let store = MemoryRankStore::new();
        store.add_repo(Repo::new(5, "github.com/fixed/id")).await.unwrap();
        store.set_star_rank("github.com/auto/one", 1.0).await;
        store.set_star_rank("github.com/auto/two", 1.0).await;

        let mut ids: Vec<i32> = store.repositories().await.unwrap().iter().map(|r| r.id).collect();
        ids.sort();
        assert_eq!(ids, vec![5, 6, 7]);
    }

    #[tokio::test]
    async fn test_add_repo_rejects_taken_id() {
        let store = MemoryRankStore::new();
        store.set_star_rank("github.com/auto/one", 1.0).await;
        let taken = store.repositories().await.unwrap()[0].id;

        assert!(store.add_repo(Repo::new(taken, "github.com/other")).await.is_err());
        // Re-registering the holder under its own id is fine.
        store.add_repo(Repo::new(taken, "github.com/auto/one")).await.unwrap();

        let mut ranks = DocumentRanks::new();
        ranks.insert("a.go".into(), vec![1.0]);
        store.set_document_ranks("github.com/auto/one", &ranks).await.unwrap();
        assert_eq!(store.last_updated_at(&[taken]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reopened_store_keeps_allocating_fresh_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ranks.json");

        let store = MemoryRankStore::open(&path).unwrap();
        store.add_repo(Repo::new(10, "github.com/a/b")).await.unwrap();
        store.save().await.unwrap();

        let reopened = MemoryRankStore::open(&path).unwrap();
        reopened.set_star_rank("github.com/c/d", 0.1).await;
        let repos = reopened.repositories().await.unwrap();
        assert_eq!(repos, vec![Repo::new(10, "github.com/a/b"), Repo::new(11, "github.com/c/d")]);
    }

    #[tokio::test]
    async fn test_save_if_changed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ranks.json");
        let store = MemoryRankStore::open(&path).unwrap();

        assert!(!store.save_if_changed().await.unwrap());
        assert!(!path.exists());

        store
            .bulk_set_document_ranks("k", "ranks/0.csv", &bulk(&[("r", "p", 1.0)]))
            .await
            .unwrap();
        assert!(store.has_unsaved_changes().await);
        assert!(store.save_if_changed().await.unwrap());
        assert!(path.exists());
        assert!(!store.save_if_changed().await.unwrap());

        // An empty merge batch is not a change.
        store.merge_document_ranks("other", 10).await.unwrap();
        assert!(!store.has_unsaved_changes().await);
        store.merge_document_ranks("k", 10).await.unwrap();
        assert!(store.has_unsaved_changes().await);
    }

    #[tokio::test]
    async fn test_memory_store_never_saves() {
        let store = MemoryRankStore::new();
        store.set_star_rank("r", 1.0).await;
        assert!(!store.save_if_changed().await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ranks.json");
        fs::write(&path, "{not json").unwrap();
        assert!(MemoryRankStore::open(&path).is_err());
    }
}
