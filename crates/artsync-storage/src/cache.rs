//! Content-addressed disk cache
//!
//! Layout:
//! ```text
//! {root}/obj/md5/{hex[0..2]}/{hex[2..]}
//! {root}/obj/etag/{h[0..2]}/{h[2..]}
//! ```
//! Writers stage bytes in a `tmp_`-prefixed file next to the destination and
//! publish with a rename, so readers in any process either see the complete
//! file or nothing.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use artsync_core::hash::Md5Reader;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{CacheError, Result};

const TEMP_PREFIX: &str = "tmp_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

#[derive(Debug)]
pub struct ContentCache {
    root: PathBuf,
    obj_dir: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let obj_dir = root.join("obj");
        for sub in ["md5", "etag"] {
            fs::create_dir_all(obj_dir.join(sub)).map_err(|source| CacheError::NotWritable {
                path: root.clone(),
                source,
            })?;
        }

        // Fail at construction rather than on the first download.
        let _scratch = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&obj_dir)
            .map_err(|source| CacheError::NotWritable {
                path: root.clone(),
                source,
            })?;

        Ok(Self { root, obj_dir })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Slot for owned content identified by its base64 MD5.
    pub fn check_md5_obj_path(&self, b64_md5: &str, size: u64) -> Result<(PathBuf, bool, CacheOpener)> {
        let hex_md5 = artsync_core::hash::b64_to_hex(b64_md5)
            .map_err(|_| CacheError::InvalidDigest(b64_md5.to_string()))?;
        if hex_md5.len() < 3 {
            return Err(CacheError::InvalidDigest(b64_md5.to_string()));
        }
        Ok(self.slot(self.obj_dir.join("md5"), &hex_md5, size))
    }

    /// Slot for referenced content identified by its URI and backend checksum.
    pub fn check_etag_obj_path(
        &self,
        uri: &str,
        checksum: &str,
        size: u64,
    ) -> Result<(PathBuf, bool, CacheOpener)> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(blake3::hash(uri.as_bytes()).as_bytes());
        hasher.update(blake3::hash(checksum.as_bytes()).as_bytes());
        let key = hasher.finalize().to_hex();
        Ok(self.slot(self.obj_dir.join("etag"), key.as_str(), size))
    }

    /// Copies `src` into the md5 store, hashing the bytes as they are
    /// written. Returns the base64 digest, size and cache path of exactly
    /// the bytes that were copied, so later edits to `src` can't make the
    /// digest disagree with the cached content.
    pub fn add_md5_file(&self, src: &Path) -> Result<(String, u64, PathBuf)> {
        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.obj_dir.join("md5"))?;
        let mut reader = Md5Reader::new(fs::File::open(src)?);
        io::copy(&mut reader, &mut temp)?;
        let (md5, size) = reader.finish();

        let (path, exists, _) = self.check_md5_obj_path(&md5, size)?;
        if exists {
            return Ok((md5, size, path));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        temp.as_file().sync_all()?;
        temp.persist(&path).map_err(|e| CacheError::Io(e.error))?;
        Ok((md5, size, path))
    }

    fn slot(&self, base: PathBuf, hex_key: &str, size: u64) -> (PathBuf, bool, CacheOpener) {
        let path = base.join(&hex_key[..2]).join(&hex_key[2..]);
        let exists = is_complete(&path, size);
        if exists {
            debug!("Cache hit: {}", path.display());
        }
        let opener = CacheOpener { path: path.clone() };
        (path, exists, opener)
    }

    /// Evicts least-recently-used content until the cache fits in
    /// `target_size` bytes. Returns the number of bytes reclaimed.
    pub fn cleanup(&self, target_size: u64, remove_temp: bool) -> Result<u64> {
        let mut reclaimed = 0u64;
        let mut temp_size = 0u64;
        let mut total = 0u64;
        let mut content = Vec::new();

        for entry in WalkDir::new(&self.obj_dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            let size = meta.len();

            if entry.file_name().to_string_lossy().starts_with(TEMP_PREFIX) {
                if remove_temp {
                    if remove_ignoring_missing(entry.path())? {
                        reclaimed += size;
                    }
                } else {
                    temp_size += size;
                }
                continue;
            }

            let last_used = meta
                .accessed()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            total += size;
            content.push((last_used, entry.into_path(), size));
        }

        if temp_size > 0 {
            warn!(
                "Cache contains {} bytes of temporary files. Run `artsync cache cleanup` without --keep-temp to remove them.",
                temp_size
            );
        }

        content.sort();
        for (_, path, size) in content {
            if total <= target_size {
                break;
            }
            if remove_ignoring_missing(&path)? {
                debug!("Evicted {} ({} bytes)", path.display(), size);
                reclaimed += size;
            }
            total -= size;
        }

        Ok(reclaimed)
    }
}

fn is_complete(path: &Path, size: u64) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() == size)
        .unwrap_or(false)
}

/// Returns false if another process removed the file first.
fn remove_ignoring_missing(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Hands out writers for one cache slot.
#[derive(Debug, Clone)]
pub struct CacheOpener {
    path: PathBuf,
}

impl CacheOpener {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self, mode: WriteMode) -> Result<CacheWriter> {
        if mode == WriteMode::Append {
            return Err(CacheError::InvalidMode("append".to_string()));
        }
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cache path has no parent: {}", self.path.display()))?;
        fs::create_dir_all(dir)?;
        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        Ok(CacheWriter {
            temp,
            dest: self.path.clone(),
        })
    }

    /// Copies `src` into the slot.
    pub fn copy_from(&self, src: &Path) -> Result<PathBuf> {
        let mut writer = self.open(WriteMode::Truncate)?;
        let mut file = fs::File::open(src)?;
        io::copy(&mut file, &mut writer)?;
        writer.commit()
    }

    /// Runs `f` against a fresh writer and publishes on success.
    pub fn write_with<F>(&self, f: F) -> Result<PathBuf>
    where
        F: FnOnce(&mut CacheWriter) -> io::Result<()>,
    {
        let mut writer = self.open(WriteMode::Truncate)?;
        f(&mut writer)?;
        writer.commit()
    }
}

/// Write-only handle; dropping it without `commit` discards the bytes.
#[derive(Debug)]
pub struct CacheWriter {
    temp: NamedTempFile,
    dest: PathBuf,
}

impl CacheWriter {
    pub fn commit(self) -> Result<PathBuf> {
        self.temp.as_file().sync_all()?;
        self.temp
            .persist(&self.dest)
            .map_err(|e| CacheError::Io(e.error))?;
        Ok(self.dest)
    }
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}
