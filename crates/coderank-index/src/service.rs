//! Read path consumed by search: repository and document ranks.
//!
//! Nothing here computes graphs. Every method reads already-persisted data
//! from the [`RankStore`] and degrades to neutral values when data is missing.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use coderank_config::{RankingConfig, Schedule};
use serde::{Deserialize, Serialize};

use crate::error::{RankingError, Result};
use crate::store::RankStore;

/// Map an unbounded non-negative score into `[0, 1)`, preserving order.
pub fn squash(x: f64) -> f64 {
    x / (1.0 + x)
}

/// Squashed sum of every configured score whose key is a directory prefix of
/// `repo` or `repo` itself.
///
/// ```
/// use std::collections::HashMap;
/// use coderank_index::service::repo_rank_from_config;
///
/// let scores = HashMap::from([("github.com/foo".to_string(), 400.0)]);
/// let rank = repo_rank_from_config(&scores, "github.com/foo/bar");
/// assert!((rank - 400.0 / 401.0).abs() < 1e-12);
/// ```
pub fn repo_rank_from_config(scores: &HashMap<String, f64>, repo: &str) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }

    let total: f64 = repo
        .match_indices('/')
        .map(|(i, _)| &repo[..i])
        .chain(std::iter::once(repo))
        .filter_map(|prefix| scores.get(prefix))
        .sum();
    squash(total)
}

/// Ordered scores for a repository; earlier components dominate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankVector(pub Vec<f64>);

impl RankVector {
    /// Ordering that puts the higher-ranked vector first.
    ///
    /// Components are compared left to right; a missing component counts as 0.
    pub fn compare_desc(&self, other: &RankVector) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0.0);
            let b = other.0.get(i).copied().unwrap_or(0.0);
            match b.total_cmp(&a) {
                Ordering::Equal => continue,
                ordering => return ordering,
            }
        }
        Ordering::Equal
    }
}

/// Document ranks of one repository, as returned to search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoPathRanks {
    /// Global reference count statistic for calibrating across repositories
    pub mean_rank: f64,
    /// Path -> log2 of the stored rank (0 stays 0)
    pub paths: HashMap<String, f64>,
}

/// Facade over the rank store for the search query path.
pub struct RankingService {
    store: Arc<dyn RankStore>,
    repo_scores: HashMap<String, f64>,
    schedule: Schedule,
}

impl RankingService {
    /// Build a service; the cron schedule is parsed once here.
    pub fn new(config: &RankingConfig, store: Arc<dyn RankStore>) -> Result<Self> {
        Ok(Self {
            store,
            repo_scores: config.repo_scores.clone(),
            schedule: config.schedule()?,
        })
    }

    /// `[manual rank, star rank]` for `repo`.
    pub async fn get_repo_rank(&self, repo: &str) -> Result<RankVector> {
        let manual = repo_rank_from_config(&self.repo_scores, repo);
        let stars = self
            .store
            .get_star_rank(repo)
            .await
            .map_err(RankingError::Store)?;
        Ok(RankVector(vec![manual, stars]))
    }

    /// Per-path ranks of `repo` on a log scale, empty when none are stored.
    pub async fn get_document_ranks(&self, repo: &str) -> Result<RepoPathRanks> {
        let Some(raw) = self
            .store
            .get_document_ranks(repo)
            .await
            .map_err(RankingError::Store)?
        else {
            return Ok(RepoPathRanks::default());
        };

        let mean_rank = self
            .store
            .get_reference_count_statistics()
            .await
            .map_err(RankingError::Store)?;

        let paths = raw
            .into_iter()
            .map(|(path, rank)| {
                let scaled = if rank == 0.0 { 0.0 } else { rank.log2() };
                (path, scaled)
            })
            .collect();

        Ok(RepoPathRanks { mean_rank, paths })
    }

    /// When the next ranking generation is due, or `None` before the first one.
    pub async fn next_job_starts_at(&self) -> Result<Option<DateTime<Utc>>> {
        let key = self
            .store
            .derivative_graph_key()
            .await
            .map_err(RankingError::Store)?;
        Ok(key.and_then(|key| self.schedule.after(&key.created_at).next()))
    }

    /// When each repository's document ranks last changed; ids without
    /// stored ranks are absent from the result.
    pub async fn last_updated_at(&self, repo_ids: &[i32]) -> Result<HashMap<i32, DateTime<Utc>>> {
        self.store
            .last_updated_at(repo_ids)
            .await
            .map_err(RankingError::Store)
    }
}
