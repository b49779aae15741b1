//! Collaborator interfaces for repository content and symbols.
//!
//! The ranking engine never talks to source control or the symbol service
//! directly; it goes through these traits so both can be swapped for RPC
//! clients in production and in-memory fakes in tests.

use std::fmt;
use std::io::Read;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A repository known to the rank store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repo {
    /// Stable numeric id, used only for staleness bookkeeping
    pub id: i32,
    /// Repository name, the primary key for ranking data
    pub name: String,
}

impl Repo {
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

/// A resolved commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(pub String);

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A named symbol and the file that defines it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub path: String,
}

impl Symbol {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Which files an archive should contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOptions {
    /// Tree to archive, e.g. a commit id
    pub treeish: String,
    /// Only paths ending in one of these suffixes (e.g. `.go`)
    pub path_suffixes: Vec<String>,
}

/// Source control access: head resolution and tar archives.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Resolve the head commit, or `None` for an empty or missing repository.
    async fn resolve_head(&self, repo: &str) -> Result<Option<CommitId>>;

    /// Open a tar stream of the files selected by `options`.
    ///
    /// The reader is consumed on a blocking thread.
    async fn archive_reader(
        &self,
        repo: &str,
        options: &ArchiveOptions,
    ) -> Result<Box<dyn Read + Send>>;
}

/// Symbol search service.
#[async_trait]
pub trait SymbolSearch: Send + Sync {
    /// List up to `first` symbols defined in `repo` at `commit`.
    async fn search(&self, repo: &str, commit: &CommitId, first: usize) -> Result<Vec<Symbol>>;
}
