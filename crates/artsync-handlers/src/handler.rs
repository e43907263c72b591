//! Storage handler trait

use std::path::PathBuf;

use artsync_core::{Error, ManifestEntry, Result};
use async_trait::async_trait;

pub const DEFAULT_MAX_OBJECTS: usize = 10_000;

/// Options for turning a reference URI into manifest entries
#[derive(Debug, Clone)]
pub struct StorePathOptions {
    /// Logical name (or prefix, for multi-object references)
    pub name: Option<String>,
    /// When false, entries are tracked without reading their content
    pub checksum: bool,
    pub max_objects: usize,
}

impl Default for StorePathOptions {
    fn default() -> Self {
        Self {
            name: None,
            checksum: true,
            max_objects: DEFAULT_MAX_OBJECTS,
        }
    }
}

impl StorePathOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }
}

/// Where a loaded entry can be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedPath {
    Reference(String),
    Local(PathBuf),
}

impl LoadedPath {
    pub fn as_local(&self) -> Option<&PathBuf> {
        match self {
            LoadedPath::Local(path) => Some(path),
            LoadedPath::Reference(_) => None,
        }
    }
}

/// Trait for handling one reference scheme
#[async_trait]
pub trait StorageHandler: Send + Sync {
    /// URI scheme this handler serves (`s3`, `file`, ...)
    fn scheme(&self) -> &str;

    /// Resolve a URI into manifest entries
    async fn store_path(&self, uri: &str, options: &StorePathOptions)
    -> Result<Vec<ManifestEntry>>;

    /// Resolve an entry back to its URI, or materialize it through the cache
    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath>;
}

pub(crate) fn entry_ref(entry: &ManifestEntry) -> Result<&str> {
    entry
        .reference
        .as_deref()
        .ok_or_else(|| Error::Other(anyhow::anyhow!("Entry {} is not a reference", entry.path)))
}

/// Path of `key` below `prefix`, without a leading slash.
pub(crate) fn relative_to<'a>(key: &'a str, prefix: &str) -> &'a str {
    key.strip_prefix(prefix)
        .unwrap_or(key)
        .trim_start_matches('/')
}

pub(crate) fn too_many(uri: &str, max_objects: usize) -> Error {
    Error::TooManyObjects {
        uri: uri.to_string(),
        max_objects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = StorePathOptions::default();
        assert!(options.checksum);
        assert_eq!(options.max_objects, 10_000);
        assert_eq!(StorePathOptions::named("x").name.as_deref(), Some("x"));
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(relative_to("dir/a/b.txt", "dir"), "a/b.txt");
        assert_eq!(relative_to("dir/a/b.txt", "dir/"), "a/b.txt");
        assert_eq!(relative_to("dir/a/b.txt", ""), "dir/a/b.txt");
    }
}
