use std::path::{Path, PathBuf};
use std::sync::Arc;

use artsync_core::hash::{md5_file_b64, md5_string};
use artsync_core::uri::{basename, join};
use artsync_core::{Error, ManifestEntry, ParsedUri, Result};
use artsync_storage::ContentCache;
use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::handler::{LoadedPath, StorageHandler, StorePathOptions, entry_ref, too_many};

/// Handles `file://` references to the local filesystem.
pub struct LocalFileHandler {
    scheme: String,
    cache: Arc<ContentCache>,
}

impl LocalFileHandler {
    pub fn new(cache: Arc<ContentCache>) -> Self {
        Self {
            scheme: "file".to_string(),
            cache,
        }
    }
}

fn local_path_of(uri: &str) -> PathBuf {
    PathBuf::from(ParsedUri::parse(uri).path)
}

fn digest_of(path: &Path, size: u64, checksum: bool) -> Result<String> {
    if checksum {
        md5_file_b64(path)
    } else {
        Ok(md5_string(&size.to_string()))
    }
}

fn collect_entries(
    uri: &str,
    local: &Path,
    options: &StorePathOptions,
) -> Result<Vec<ManifestEntry>> {
    if local.is_dir() {
        info!(
            "Generating checksum for up to {} files in \"{}\"",
            options.max_objects,
            local.display()
        );
        let mut entries = Vec::new();
        for item in WalkDir::new(local).follow_links(true) {
            let item = item.map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
            if !item.file_type().is_file() {
                continue;
            }
            if entries.len() == options.max_objects {
                return Err(too_many(uri, options.max_objects));
            }
            let physical = item.path();
            let relative = physical
                .strip_prefix(local)
                .map_err(|e| Error::Other(anyhow::anyhow!(e)))?
                .to_string_lossy()
                .replace('\\', "/");
            let logical = match &options.name {
                Some(name) => join(name, &relative),
                None => relative.clone(),
            };
            let size = item.metadata().map_err(|e| Error::Other(anyhow::anyhow!(e)))?.len();
            entries.push(
                ManifestEntry::new(logical, digest_of(physical, size, options.checksum)?)
                    .with_reference(join(uri, &relative))
                    .with_size(size),
            );
        }
        Ok(entries)
    } else if local.is_file() {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| basename(&local.to_string_lossy()).to_string());
        let size = std::fs::metadata(local)?.len();
        Ok(vec![
            ManifestEntry::new(name, digest_of(local, size, options.checksum)?)
                .with_reference(uri)
                .with_size(size),
        ])
    } else {
        Err(Error::NotFileOrDirectory(uri.to_string()))
    }
}

#[async_trait]
impl StorageHandler for LocalFileHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn store_path(
        &self,
        uri: &str,
        options: &StorePathOptions,
    ) -> Result<Vec<ManifestEntry>> {
        let uri_owned = uri.to_string();
        let options = options.clone();
        tokio::task::spawn_blocking(move || {
            collect_entries(&uri_owned, &local_path_of(&uri_owned), &options)
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("hashing task failed: {}", e)))?
    }

    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        let uri = entry_ref(entry)?;
        if !local {
            return Ok(LoadedPath::Reference(uri.to_string()));
        }

        let source = local_path_of(uri);
        if !source.is_file() {
            return Err(Error::NotAFile(source.display().to_string()));
        }

        let (path, hit, opener) = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.size.unwrap_or(0))?;
        if hit {
            return Ok(LoadedPath::Local(path));
        }

        let digest = entry.digest.clone();
        let uri = uri.to_string();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let found = md5_file_b64(&source)?;
            if found != digest {
                return Err(Error::DigestMismatch {
                    uri,
                    expected: digest,
                    found,
                });
            }
            opener.copy_from(&source)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("copy task failed: {}", e)))??;

        debug!("Cached local reference at {}", path.display());
        Ok(LoadedPath::Local(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn handler() -> (TempDir, LocalFileHandler) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path().join("cache")).unwrap());
        (dir, LocalFileHandler::new(cache))
    }

    fn file_uri(path: &Path) -> String {
        format!("file://{}", path.display())
    }

    #[tokio::test]
    async fn test_store_single_file() {
        let (dir, handler) = handler();
        let file = dir.path().join("file.txt");
        fs::write(&file, "hello").unwrap();

        let entries = handler
            .store_path(&file_uri(&file), &StorePathOptions::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "file.txt");
        assert_eq!(entries[0].digest, "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(entries[0].size, Some(5));
    }

    #[tokio::test]
    async fn test_store_directory_with_prefix() {
        let (dir, handler) = handler();
        let root = dir.path().join("data");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("sub/b.txt"), "bb").unwrap();

        let uri = file_uri(&root);
        let entries = handler
            .store_path(&uri, &StorePathOptions::named("prefix"))
            .await
            .unwrap();
        let mut paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
        paths.sort();
        assert_eq!(paths, vec!["prefix/a.txt", "prefix/sub/b.txt"]);
        let b = entries.iter().find(|e| e.path == "prefix/sub/b.txt").unwrap();
        assert_eq!(b.reference.as_deref(), Some(format!("{}/sub/b.txt", uri).as_str()));
    }

    #[tokio::test]
    async fn test_store_without_checksum_hashes_size() {
        let (dir, handler) = handler();
        let file = dir.path().join("big.bin");
        fs::write(&file, vec![1u8; 42]).unwrap();

        let options = StorePathOptions {
            checksum: false,
            ..StorePathOptions::default()
        };
        let entries = handler.store_path(&file_uri(&file), &options).await.unwrap();
        assert_eq!(entries[0].digest, md5_string("42"));
    }

    #[tokio::test]
    async fn test_too_many_files() {
        let (dir, handler) = handler();
        let root = dir.path().join("many");
        fs::create_dir_all(&root).unwrap();
        for i in 0..4 {
            fs::write(root.join(format!("{}.txt", i)), "x").unwrap();
        }
        let options = StorePathOptions {
            max_objects: 3,
            ..StorePathOptions::default()
        };
        let err = handler.store_path(&file_uri(&root), &options).await.unwrap_err();
        assert!(matches!(err, Error::TooManyObjects { max_objects: 3, .. }));
    }

    #[tokio::test]
    async fn test_missing_path() {
        let (dir, handler) = handler();
        let err = handler
            .store_path(&file_uri(&dir.path().join("nope")), &StorePathOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFileOrDirectory(_)));
    }

    #[tokio::test]
    async fn test_load_path_uses_cache() {
        let (dir, handler) = handler();
        let file = dir.path().join("file.txt");
        fs::write(&file, "hello").unwrap();
        let digest = "XUFAKrxLKna5cZ2REBfFkg==";

        let (path, _, opener) = handler.cache.check_md5_obj_path(digest, 5).unwrap();
        opener.write_with(|w| std::io::Write::write_all(w, b"hello")).unwrap();

        let entry = ManifestEntry::new("foo/bar", digest)
            .with_reference(file_uri(&file))
            .with_size(5);
        let loaded = handler.load_path(&entry, true).await.unwrap();
        assert_eq!(loaded, LoadedPath::Local(path));
    }

    #[tokio::test]
    async fn test_load_path_copies_into_cache() {
        let (dir, handler) = handler();
        let file = dir.path().join("file.txt");
        fs::write(&file, "hello").unwrap();

        let entry = ManifestEntry::new("file.txt", "XUFAKrxLKna5cZ2REBfFkg==")
            .with_reference(file_uri(&file))
            .with_size(5);
        let loaded = handler.load_path(&entry, true).await.unwrap();
        let path = loaded.as_local().unwrap();
        assert!(path.starts_with(handler.cache.root()));
        assert_eq!(fs::read_to_string(path).unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_load_path_detects_changed_file() {
        let (dir, handler) = handler();
        let file = dir.path().join("file.txt");
        fs::write(&file, "changed").unwrap();

        let entry = ManifestEntry::new("file.txt", "XUFAKrxLKna5cZ2REBfFkg==")
            .with_reference(file_uri(&file))
            .with_size(5);
        let err = handler.load_path(&entry, true).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }
}
