//! Whole-word symbol matching over raw file bytes.
//!
//! A "word" is a maximal run of `[A-Za-z0-9_]` bytes. A symbol matches a file
//! only when some word is byte-for-byte equal to it, so `foo` does not match
//! inside `foobar` or `foo_bar`.

use std::collections::{BTreeMap, HashSet};

/// Symbol name -> paths that define it.
///
/// Ordered so that edges come out of a file in a stable order.
pub type SymbolPaths = BTreeMap<String, Vec<String>>;

/// Whether `b` can be part of an identifier.
#[inline]
pub fn is_symbol_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// `[start, end)` spans of every word in `content`, in scan order.
pub fn word_spans(content: &[u8]) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start = None;

    for (i, &b) in content.iter().enumerate() {
        match (is_symbol_byte(b), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                spans.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, content.len()));
    }

    spans
}

/// Paths referenced by `content` through whole-word occurrences of `symbols`.
///
/// Each symbol contributes its paths once no matter how often it occurs, and
/// each path is returned at most once. The order is deterministic but does not
/// follow where symbols occur in `content`: paths come in symbol name order,
/// then in the order the symbol lists them.
pub fn referenced_paths<'a>(content: &[u8], symbols: &'a SymbolPaths) -> Vec<&'a str> {
    if content.is_empty() || symbols.is_empty() {
        return Vec::new();
    }

    let words: HashSet<&[u8]> = word_spans(content)
        .into_iter()
        .map(|(start, end)| &content[start..end])
        .collect();

    let mut seen = HashSet::new();
    let mut paths = Vec::new();
    for (symbol, defining_paths) in symbols {
        if !words.contains(symbol.as_bytes()) {
            continue;
        }
        for path in defining_paths {
            if seen.insert(path.as_str()) {
                paths.push(path.as_str());
            }
        }
    }

    paths
}
