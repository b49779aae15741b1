//! File-level ranking for code search.
//!
//! This crate provides:
//! - Whole-word symbol matching over file contents
//! - File reference graphs streamed from repository archives
//! - PageRank over streaming graphs with cancellation
//! - Ingestion of precomputed rank exports from a results bucket
//! - Periodic indexer, loader and merger tasks
//! - The read-only ranking service used by search

pub mod bucket;
pub mod error;
pub mod graph;
pub mod graph_builder;
pub mod indexer;
pub mod loader;
pub mod pagerank;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod store;
pub mod streaming;
pub mod symbols;
pub mod tokenizer;

// Re-exports
pub use bucket::{LocalBucket, ObjectPage, ResultsBucket};
pub use error::{RankingError, Result};
pub use graph::RankGraph;
pub use graph_builder::{FileReferenceGraphBuilder, ScanStats};
pub use indexer::{IndexStats, RepositoryIndexer};
pub use loader::{LoaderStats, RankLoader};
pub use pagerank::{page_rank_from_streaming_graph, DocumentRanks, PageRanker, PathRanks};
pub use scheduler::{spawn_periodic, PeriodicTask, RankingJobs};
pub use service::{squash, RankVector, RankingService, RepoPathRanks};
pub use source::{ArchiveOptions, CommitId, Repo, SourceControl, Symbol, SymbolSearch};
pub use store::{BulkRanks, GraphKey, MemoryRankStore, MergeStats, RankStore};
pub use streaming::{Edge, EdgeSender, StreamingGraph};
