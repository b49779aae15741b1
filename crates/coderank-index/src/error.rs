//! Error type shared by the ranking engine.

use thiserror::Error;

/// Errors produced while building graphs, ranking, or ingesting rank files.
///
/// Collaborator failures keep the underlying `anyhow::Error` so the cause chain
/// survives into logs; the variant names which collaborator failed.
#[derive(Error, Debug)]
pub enum RankingError {
    /// The caller's cancellation token fired before the operation finished.
    #[error("operation cancelled")]
    Cancelled,

    #[error("malformed row at line {line} of {object}: expected 3 fields, got {fields}")]
    MalformedRow {
        object: String,
        line: u64,
        fields: usize,
    },

    #[error("invalid rank {value:?} at line {line} of {object}")]
    InvalidRank {
        object: String,
        line: u64,
        value: String,
    },

    #[error("failed to read rank file {object}: {source}")]
    Csv {
        object: String,
        #[source]
        source: csv::Error,
    },

    #[error("failed to read repository archive: {0}")]
    Archive(#[from] std::io::Error),

    #[error("source control request failed: {0:#}")]
    SourceControl(anyhow::Error),

    #[error("symbol search failed: {0:#}")]
    SymbolSearch(anyhow::Error),

    #[error("rank store request failed: {0:#}")]
    Store(anyhow::Error),

    #[error("results bucket request failed: {0:#}")]
    Bucket(anyhow::Error),

    #[error(transparent)]
    Schedule(#[from] coderank_config::ConfigError),

    #[error("background worker exited abnormally: {0}")]
    TaskPanicked(String),
}

impl RankingError {
    /// True when the error came from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RankingError::Cancelled)
    }
}

impl From<tokio::task::JoinError> for RankingError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            RankingError::Cancelled
        } else {
            RankingError::TaskPanicked(err.to_string())
        }
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, RankingError>;
