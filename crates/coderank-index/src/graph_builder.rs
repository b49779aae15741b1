//! File reference graph construction.
//!
//! A file references another when its text contains, as a whole word, a symbol
//! defined in the other file with the same extension. The repository archive is
//! scanned on a blocking thread and edges are streamed to the caller as they
//! are found, so ranking can start before the scan finishes.

use std::io::Read;
use std::sync::Arc;

use coderank_config::IndexerConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{RankingError, Result};
use crate::source::{ArchiveOptions, SourceControl, SymbolSearch};
use crate::streaming::{Edge, EdgeSender, StreamingGraph};
use crate::symbols::{extension_of, extract_symbols, group_by_extension, SymbolsByExtension};
use crate::tokenizer::referenced_paths;

/// Path segment excluded from scanning.
const VENDOR_SEGMENT: &str = "vendor";

/// Counters for one archive scan.
#[derive(Debug, Default, Clone)]
pub struct ScanStats {
    /// Files whose contents were matched against symbols
    pub files_scanned: usize,
    /// Files skipped for size, vendoring, or an unknown extension
    pub files_skipped: usize,
    /// Edges handed to the consumer
    pub edges_emitted: usize,
}

/// Builds streaming file reference graphs for repositories.
pub struct FileReferenceGraphBuilder {
    source: Arc<dyn SourceControl>,
    search: Arc<dyn SymbolSearch>,
    config: IndexerConfig,
}

impl FileReferenceGraphBuilder {
    pub fn new(
        source: Arc<dyn SourceControl>,
        search: Arc<dyn SymbolSearch>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            source,
            search,
            config,
        }
    }

    /// Start building the reference graph of `repo`'s head snapshot.
    ///
    /// Symbol extraction and archive setup happen before this returns; the
    /// archive scan itself runs concurrently and feeds the returned graph.
    /// A repository without a head commit yields an empty graph.
    pub async fn build(&self, repo: &str, cancel: &CancellationToken) -> Result<StreamingGraph> {
        let Some(extracted) = extract_symbols(
            self.source.as_ref(),
            self.search.as_ref(),
            repo,
            self.config.max_symbols,
        )
        .await?
        else {
            return Ok(StreamingGraph::empty());
        };

        let by_extension = group_by_extension(&extracted.by_path);
        if by_extension.is_empty() {
            debug!(repo, "no symbols with file extensions, graph is empty");
            return Ok(StreamingGraph::empty());
        }

        let options = ArchiveOptions {
            treeish: extracted.commit.0.clone(),
            path_suffixes: by_extension.keys().cloned().collect(),
        };
        let reader = self
            .source
            .archive_reader(repo, &options)
            .await
            .map_err(RankingError::SourceControl)?;

        let (sender, mut graph) =
            StreamingGraph::channel(self.config.channel_capacity, cancel.child_token());
        let max_file_size = self.config.max_file_size;
        let repo_name = repo.to_string();

        graph.attach_producer(tokio::task::spawn_blocking(move || {
            match scan_archive(reader, &by_extension, max_file_size, &sender) {
                Ok(stats) => info!(
                    repo = %repo_name,
                    files_scanned = stats.files_scanned,
                    files_skipped = stats.files_skipped,
                    edges = stats.edges_emitted,
                    "scanned repository archive"
                ),
                Err(err) => sender.fail_blocking(err),
            }
        }));

        Ok(graph)
    }
}

/// Scan a tar stream and send every reference edge found.
///
/// Stops early, without error, once the consumer goes away or the operation is
/// cancelled. Cancellation is checked between files.
pub fn scan_archive<R: Read>(
    reader: R,
    by_extension: &SymbolsByExtension,
    max_file_size: u64,
    sender: &EdgeSender,
) -> Result<ScanStats> {
    let mut stats = ScanStats::default();
    let mut archive = tar::Archive::new(reader);
    let mut contents = Vec::new();

    for entry in archive.entries()? {
        if sender.is_closed() {
            debug!("edge consumer closed, stopping archive scan");
            break;
        }

        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = normalize_path(&entry.path()?.to_string_lossy());
        let size = entry.header().size()?;
        let symbols = extension_of(&path).and_then(|ext| by_extension.get(&ext));

        let symbols = match symbols {
            Some(symbols) if size <= max_file_size && !is_vendored(&path) => symbols,
            _ => {
                stats.files_skipped += 1;
                continue;
            }
        };

        contents.clear();
        entry.read_to_end(&mut contents)?;
        stats.files_scanned += 1;

        for target in referenced_paths(&contents, symbols) {
            if target == path {
                continue;
            }
            if !sender.send_blocking(Edge::new(path.clone(), target)) {
                return Ok(stats);
            }
            stats.edges_emitted += 1;
        }
    }

    Ok(stats)
}

/// Whether any directory segment of `path` is a vendor directory.
pub fn is_vendored(path: &str) -> bool {
    path.split('/')
        .rev()
        .skip(1)
        .any(|segment| segment == VENDOR_SEGMENT)
}

fn normalize_path(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}
