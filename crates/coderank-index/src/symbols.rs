//! Symbol extraction for a repository's head snapshot.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::debug;

use crate::error::{RankingError, Result};
use crate::source::{CommitId, SourceControl, SymbolSearch};
use crate::tokenizer::SymbolPaths;

/// Name the symbol service uses for anonymous or placeholder bindings.
pub const ANONYMOUS_SYMBOL: &str = "_";

/// File path -> names of the symbols it defines.
pub type SymbolsByPath = HashMap<String, Vec<String>>;

/// File extension (with leading dot) -> symbols defined in files with it.
pub type SymbolsByExtension = BTreeMap<String, SymbolPaths>;

/// Symbols of a repository at a resolved commit.
#[derive(Debug, Clone)]
pub struct ExtractedSymbols {
    pub commit: CommitId,
    pub by_path: SymbolsByPath,
}

/// Fetch the symbols defined at the head of `repo`, grouped by path.
///
/// Returns `Ok(None)` when the repository has no head commit.
pub async fn extract_symbols(
    source: &dyn SourceControl,
    search: &dyn SymbolSearch,
    repo: &str,
    max_symbols: usize,
) -> Result<Option<ExtractedSymbols>> {
    let Some(commit) = source
        .resolve_head(repo)
        .await
        .map_err(RankingError::SourceControl)?
    else {
        debug!(repo, "no head commit, skipping symbol extraction");
        return Ok(None);
    };

    let symbols = search
        .search(repo, &commit, max_symbols)
        .await
        .map_err(RankingError::SymbolSearch)?;

    let mut by_path = SymbolsByPath::new();
    for symbol in symbols {
        if symbol.name == ANONYMOUS_SYMBOL {
            continue;
        }
        by_path.entry(symbol.path).or_default().push(symbol.name);
    }

    debug!(repo, %commit, paths = by_path.len(), "extracted symbols");
    Ok(Some(ExtractedSymbols { commit, by_path }))
}

/// Extension of the final path component including the dot, e.g. `.go`.
pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
}

/// Regroup symbols by the extension of their defining file.
///
/// Files without an extension are dropped: they have no suffix to filter the
/// archive by and no same-language peers to reference.
pub fn group_by_extension(by_path: &SymbolsByPath) -> SymbolsByExtension {
    let mut grouped = SymbolsByExtension::new();

    for (path, names) in by_path {
        let Some(ext) = extension_of(path) else {
            continue;
        };
        let symbols = grouped.entry(ext).or_default();
        for name in names {
            let paths = symbols.entry(name.clone()).or_default();
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
    }

    for symbols in grouped.values_mut() {
        for paths in symbols.values_mut() {
            paths.sort();
        }
    }

    grouped
}
