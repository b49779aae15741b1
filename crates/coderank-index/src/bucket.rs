//! Object storage holding precomputed rank exports.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use walkdir::WalkDir;

/// Default number of names per listing page for [`LocalBucket`].
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// One page of an object listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    /// Object names in lexicographic order
    pub names: Vec<String>,
    /// Token for the next page, `None` on the last page
    pub continuation: Option<String>,
}

/// A bucket of rank export objects.
#[async_trait]
pub trait ResultsBucket: Send + Sync {
    /// Bucket name, for logging.
    fn name(&self) -> &str;

    /// List one page of object names starting with `prefix`.
    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage>;

    /// Open an object for streaming reads.
    async fn open(&self, name: &str) -> Result<Box<dyn Read + Send>>;

    /// List every object name under `prefix`, following continuation tokens.
    async fn list_all(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut continuation = None;

        loop {
            let page = self.list_page(prefix, continuation.take()).await?;
            names.extend(page.names);
            match page.continuation {
                Some(token) => continuation = Some(token),
                None => break,
            }
        }

        Ok(names)
    }
}

/// A directory standing in for a bucket; object names are `/`-separated
/// paths relative to the root.
#[derive(Debug, Clone)]
pub struct LocalBucket {
    name: String,
    root: PathBuf,
    page_size: usize,
}

impl LocalBucket {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the listing page size (minimum 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("invalid object name {:?}", name);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ResultsBucket for LocalBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_page(&self, prefix: &str, continuation: Option<String>) -> Result<ObjectPage> {
        let root = self.root.clone();
        let all = tokio::task::spawn_blocking(move || object_names(&root)).await??;
        let mut matching = all
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .filter(|name| continuation.as_ref().map_or(true, |after| name > after));

        let names: Vec<String> = matching.by_ref().take(self.page_size).collect();
        let continuation = match (matching.next(), names.last()) {
            (Some(_), Some(last)) => Some(last.clone()),
            _ => None,
        };

        Ok(ObjectPage {
            names,
            continuation,
        })
    }

    async fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(name)?;
        let file = tokio::task::spawn_blocking(move || {
            File::open(&path).with_context(|| format!("Failed to open object {:?}", path))
        })
        .await??;
        Ok(Box::new(file))
    }
}

/// Every object name under `root`, sorted.
fn object_names(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("Failed to walk bucket {:?}", root))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| anyhow!("object outside bucket root: {}", e))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        names.push(name);
    }
    names.sort();
    Ok(names)
}
