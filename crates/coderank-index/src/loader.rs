//! Ingestion of precomputed rank exports and merging into the rank table.
//!
//! Offline jobs write CSV files of `repo,path,rank` rows (no header) under a
//! fixed prefix of the results bucket. Each object is ingested at most once per
//! graph key: the object name is recorded by the same store call that queues
//! its rows, and later passes skip every name the store already knows.

use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use coderank_config::RankingConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bucket::ResultsBucket;
use crate::error::{RankingError, Result};
use crate::store::{BulkRanks, MergeStats, RankStore};

/// Marker object written when an export batch completes.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Counters for one loader pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoaderStats {
    /// Objects parsed and bulk-written
    pub files_processed: usize,
    /// Objects skipped because they were ingested before
    pub files_already_seen: usize,
    /// CSV rows parsed
    pub rows_processed: usize,
    /// Bytes consumed from the bucket
    pub bytes_read: u64,
    /// Total time in milliseconds
    pub duration_ms: u64,
}

/// Rows of a single rank export.
#[derive(Debug, Default)]
pub struct ParsedRankFile {
    pub ranks: BulkRanks,
    pub rows: usize,
    pub bytes_read: u64,
}

/// Parse one rank export, failing on the first malformed row.
pub fn parse_rank_file<R: Read>(object: &str, reader: R) -> Result<ParsedRankFile> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(reader);
    let mut record = csv::StringRecord::new();
    let mut parsed = ParsedRankFile::default();

    loop {
        let more = csv_reader
            .read_record(&mut record)
            .map_err(|source| RankingError::Csv {
                object: object.to_string(),
                source,
            })?;
        if !more {
            break;
        }

        let line = record.position().map_or(0, |p| p.line());
        if record.len() < 3 {
            return Err(RankingError::MalformedRow {
                object: object.to_string(),
                line,
                fields: record.len(),
            });
        }

        let value = &record[2];
        let rank: f64 = value.trim().parse().map_err(|_| RankingError::InvalidRank {
            object: object.to_string(),
            line,
            value: value.to_string(),
        })?;

        parsed
            .ranks
            .entry(record[0].to_string())
            .or_default()
            .entry(record[1].to_string())
            .or_default()
            .push(rank);
        parsed.rows += 1;
    }

    parsed.bytes_read = csv_reader.position().byte();
    Ok(parsed)
}

/// Loads rank exports from the results bucket and merges them into the store.
pub struct RankLoader {
    config: Arc<RankingConfig>,
    store: Arc<dyn RankStore>,
    bucket: Option<Arc<dyn ResultsBucket>>,
}

impl RankLoader {
    pub fn new(
        config: Arc<RankingConfig>,
        store: Arc<dyn RankStore>,
        bucket: Option<Arc<dyn ResultsBucket>>,
    ) -> Self {
        Self {
            config,
            store,
            bucket,
        }
    }

    /// The bucket to read from, or `None` when ranking is disabled or no
    /// results bucket is configured.
    fn active_bucket(&self) -> Option<&Arc<dyn ResultsBucket>> {
        if !self.config.enabled || self.config.results_bucket().is_none() {
            return None;
        }
        self.bucket.as_ref()
    }

    /// Ingest every rank export not yet recorded for the configured graph key.
    ///
    /// Stops at the first object that fails to parse or write; objects before
    /// it stay committed and the failed one is retried on the next pass.
    pub async fn load_ranks(&self, cancel: &CancellationToken) -> Result<LoaderStats> {
        let Some(bucket) = self.active_bucket() else {
            debug!("ranking disabled or no results bucket, skipping load");
            return Ok(LoaderStats::default());
        };

        let start = Instant::now();
        let prefix = self.config.loader.results_object_prefix.as_str();
        let graph_key = self.config.loader.results_graph_key.as_str();
        let mut stats = LoaderStats::default();

        let success_marker = format!("{prefix}{SUCCESS_MARKER}");
        let names: Vec<String> = bucket
            .list_all(prefix)
            .await
            .map_err(RankingError::Bucket)?
            .into_iter()
            .filter(|name| name != prefix && *name != success_marker)
            .collect();

        let known: HashSet<String> = self
            .store
            .has_input_filename(graph_key, &names)
            .await
            .map_err(RankingError::Store)?
            .into_iter()
            .collect();
        stats.files_already_seen = known.len();

        for name in names.iter().filter(|name| !known.contains(*name)) {
            if cancel.is_cancelled() {
                return Err(RankingError::Cancelled);
            }

            let reader = bucket.open(name).await.map_err(RankingError::Bucket)?;
            let object = name.clone();
            let parsed =
                tokio::task::spawn_blocking(move || parse_rank_file(&object, reader)).await??;

            self.store
                .bulk_set_document_ranks(graph_key, name, &parsed.ranks)
                .await
                .map_err(RankingError::Store)?;

            debug!(
                object = %name,
                rows = parsed.rows,
                bytes = parsed.bytes_read,
                "ingested rank file"
            );
            stats.files_processed += 1;
            stats.rows_processed += parsed.rows;
            stats.bytes_read += parsed.bytes_read;
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            bucket = bucket.name(),
            graph_key,
            files_processed = stats.files_processed,
            files_already_seen = stats.files_already_seen,
            rows = stats.rows_processed,
            bytes_read = stats.bytes_read,
            "rank load complete"
        );
        Ok(stats)
    }

    /// Merge one batch of bulk-written rows into the queryable rank table.
    pub async fn merge_ranks(&self) -> Result<MergeStats> {
        if self.active_bucket().is_none() {
            debug!("ranking disabled or no results bucket, skipping merge");
            return Ok(MergeStats::default());
        }

        let graph_key = self.config.loader.results_graph_key.as_str();
        let stats = self
            .store
            .merge_document_ranks(graph_key, self.config.merger.batch_size)
            .await
            .map_err(RankingError::Store)?;

        info!(
            graph_key,
            repos_updated = stats.repos_updated,
            rows = stats.rows_processed,
            "rank merge complete"
        );
        Ok(stats)
    }
}
