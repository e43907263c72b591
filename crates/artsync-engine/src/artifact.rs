//! Artifact staging.
//!
//! An [`Artifact`] collects files, directories and references into a
//! [`Manifest`]. Local content is hashed and copied into the content cache as
//! it is added, so sources may change or disappear afterwards. Finalizing
//! freezes the manifest and produces the serialized manifest file that is
//! uploaded alongside the content.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use artsync_core::hash::{md5_bytes, md5_file_b64};
use artsync_core::uri::basename;
use artsync_core::{Error, Manifest, ManifestEntry, ParsedUri, Result, validate_name};
use artsync_handlers::StorePathOptions;
use artsync_storage::ContentCache;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::policy::StoragePolicy;

pub const MANIFEST_FILE_NAME: &str = "wandb_manifest.json";
pub const DEFAULT_HASH_WORKERS: usize = 8;

/// Everything the save protocol needs from a finalized artifact.
#[derive(Debug, Clone)]
pub struct FinalizedArtifact {
    pub digest: String,
    /// The serialized manifest file, uploaded before any content.
    pub l0_entries: Vec<ManifestEntry>,
    /// Manifest including local paths of the content to upload.
    pub manifest_json: Value,
}

pub struct Artifact {
    name: String,
    artifact_type: String,
    description: Option<String>,
    metadata: Option<Value>,
    aliases: Vec<String>,
    policy: Arc<StoragePolicy>,
    cache: Arc<ContentCache>,
    manifest: Manifest,
    /// Removed once the artifact is finalized.
    staging: Option<TempDir>,
    staged_new_files: bool,
    added_local_paths: HashMap<PathBuf, String>,
    hash_workers: usize,
    is_final: bool,
    finalized: Option<FinalizedArtifact>,
}

/// Hashes `physical` and builds its entry. With `cache_copy` the bytes are
/// hashed while they are copied into the cache and the entry points there;
/// otherwise it points at `physical`.
fn hash_local_file(
    cache: &ContentCache,
    logical: String,
    physical: &Path,
    cache_copy: bool,
) -> Result<ManifestEntry> {
    let (digest, size, local_path) = if cache_copy {
        cache.add_md5_file(physical)?
    } else {
        let digest = md5_file_b64(physical)?;
        let size = fs::metadata(physical)?.len();
        (digest, size, physical.to_path_buf())
    };
    Ok(ManifestEntry::new(logical, digest)
        .with_size(size)
        .with_local_path(local_path))
}

fn copy_into_cache(cache: &ContentCache, digest: &str, size: u64, src: &Path) -> Result<PathBuf> {
    let (path, hit, opener) = cache.check_md5_obj_path(digest, size)?;
    if hit {
        return Ok(path);
    }
    Ok(opener.copy_from(src)?)
}

/// `(logical, physical)` for every file under `root`, sorted by logical path.
fn walk_dir(root: &Path, prefix: Option<&str>) -> Result<Vec<(String, PathBuf)>> {
    let mut paths = Vec::new();
    for item in WalkDir::new(root).follow_links(true) {
        let item = item.map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        if !item.file_type().is_file() {
            continue;
        }
        let relative = item
            .path()
            .strip_prefix(root)
            .map_err(|e| Error::Other(anyhow::anyhow!(e)))?
            .to_string_lossy()
            .replace('\\', "/");
        let logical = match prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), relative),
            None => relative,
        };
        paths.push((logical, item.into_path()));
    }
    paths.sort();
    Ok(paths)
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("Blocking task failed: {}", e)))?
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        artifact_type: impl Into<String>,
        policy: Arc<StoragePolicy>,
        cache: Arc<ContentCache>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        let artifact_type = artifact_type.into();
        if artifact_type.trim().is_empty() {
            return Err(Error::MissingType);
        }
        let staging = tempfile::Builder::new().prefix("artsync-staging-").tempdir()?;
        Ok(Self {
            name,
            artifact_type,
            description: None,
            metadata: None,
            aliases: Vec::new(),
            manifest: Manifest::new(policy.config()),
            policy,
            cache,
            staging: Some(staging),
            staged_new_files: false,
            added_local_paths: HashMap::new(),
            hash_workers: DEFAULT_HASH_WORKERS,
            is_final: false,
            finalized: None,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = workers.max(1);
        self
    }

    fn ensure_can_add(&self) -> Result<()> {
        if self.is_final {
            return Err(Error::Finalized);
        }
        Ok(())
    }

    fn insert(&mut self, entry: ManifestEntry, source: Option<&Path>) -> Result<()> {
        if let Some(source) = source {
            self.added_local_paths
                .insert(source.to_path_buf(), entry.path.clone());
        }
        self.manifest.add_entry(entry)
    }

    pub async fn add_file(
        &mut self,
        local_path: impl AsRef<Path>,
        name: Option<&str>,
    ) -> Result<ManifestEntry> {
        self.ensure_can_add()?;
        let local_path = local_path.as_ref().to_path_buf();
        if !local_path.is_file() {
            return Err(Error::NotAFile(local_path.display().to_string()));
        }
        let logical = match name {
            Some(name) => name.to_string(),
            None => basename(&local_path.to_string_lossy()).to_string(),
        };
        if self.manifest.contains(&logical) {
            return Err(Error::DuplicatePath(logical));
        }

        let cache = self.cache.clone();
        let physical = local_path.clone();
        let entry = blocking(move || hash_local_file(&cache, logical, &physical, true)).await?;
        self.insert(entry.clone(), Some(&local_path))?;
        debug!("Added {} as {}", local_path.display(), entry.path);
        Ok(entry)
    }

    pub async fn add_dir(
        &mut self,
        local_path: impl AsRef<Path>,
        name: Option<&str>,
    ) -> Result<Vec<ManifestEntry>> {
        self.ensure_can_add()?;
        let local_path = local_path.as_ref().to_path_buf();
        if !local_path.is_dir() {
            return Err(Error::NotADirectory(local_path.display().to_string()));
        }
        info!("Adding directory to artifact ({})", local_path.display());
        self.add_dir_entries(local_path, name.map(str::to_string), true)
            .await
    }

    /// Hashes on up to `hash_workers` blocking threads, then inserts in
    /// logical-path order from this task alone.
    async fn add_dir_entries(
        &mut self,
        root: PathBuf,
        prefix: Option<String>,
        cache_copy: bool,
    ) -> Result<Vec<ManifestEntry>> {
        let walk_root = root.clone();
        let paths = blocking(move || walk_dir(&walk_root, prefix.as_deref())).await?;

        let cache = self.cache.clone();
        let hashed: Vec<Result<(PathBuf, ManifestEntry)>> = stream::iter(paths)
            .map(|(logical, physical)| {
                let cache = cache.clone();
                blocking(move || {
                    let entry = hash_local_file(&cache, logical, &physical, cache_copy)?;
                    Ok((physical, entry))
                })
            })
            .buffered(self.hash_workers)
            .collect()
            .await;

        let mut added = Vec::with_capacity(hashed.len());
        for result in hashed {
            let (physical, entry) = result?;
            self.insert(entry.clone(), Some(&physical))?;
            added.push(entry);
        }
        info!("Added {} files from {}", added.len(), root.display());
        Ok(added)
    }

    /// Creates a file inside the artifact's staging area. Its content is
    /// picked up when the artifact is finalized.
    pub fn new_file(&mut self, name: &str) -> Result<File> {
        self.ensure_can_add()?;
        let relative = Path::new(name.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.as_os_str().is_empty() || escapes {
            return Err(Error::InvalidPath(name.to_string()));
        }
        let staging = self.staging.as_ref().ok_or(Error::Finalized)?;
        let path = staging.path().join(relative);
        if path.exists() || self.manifest.contains(name) {
            return Err(Error::FileExists(name.to_string()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.staged_new_files = true;
        Ok(file)
    }

    pub async fn add_reference(
        &mut self,
        uri: &str,
        name: Option<&str>,
        checksum: bool,
        max_objects: Option<usize>,
    ) -> Result<Vec<ManifestEntry>> {
        self.ensure_can_add()?;
        if !ParsedUri::parse(uri).has_scheme() {
            return Err(Error::ReferenceNotUri(uri.to_string()));
        }
        let mut options = StorePathOptions {
            name: name.map(str::to_string),
            checksum,
            ..StorePathOptions::default()
        };
        if let Some(max_objects) = max_objects {
            options.max_objects = max_objects;
        }

        let entries = self.policy.store_reference(uri, &options).await?;
        for entry in &entries {
            self.insert(entry.clone(), None)?;
        }
        Ok(entries)
    }

    /// Logical name of a file added from `local_path`, if any.
    pub fn get_added_local_path_name(&self, local_path: impl AsRef<Path>) -> Option<&str> {
        self.added_local_paths
            .get(local_path.as_ref())
            .map(String::as_str)
    }

    /// Freezes the artifact. Repeated calls return the first result.
    pub async fn finalize(&mut self) -> Result<&FinalizedArtifact> {
        if self.finalized.is_none() {
            let finalized = self.finalize_once().await?;
            self.finalized = Some(finalized);
        }
        self.finalized
            .as_ref()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("artifact finalize produced nothing")))
    }

    async fn finalize_once(&mut self) -> Result<FinalizedArtifact> {
        if self.staged_new_files {
            if let Some(staging) = self.staging.as_ref().map(|d| d.path().to_path_buf()) {
                self.add_dir_entries(staging, None, false).await?;
            }
        }
        self.is_final = true;

        let digest = self.manifest.digest();
        self.move_staged_into_cache().await?;

        let bytes = serde_json::to_vec_pretty(&self.manifest.to_manifest_json(false)?)?;
        let cache = self.cache.clone();
        let l0 = blocking(move || {
            let md5 = md5_bytes(&bytes);
            let size = bytes.len() as u64;
            let (path, hit, opener) = cache.check_md5_obj_path(&md5, size)?;
            let path = if hit {
                path
            } else {
                opener.write_with(|w| w.write_all(&bytes))?
            };
            Ok(ManifestEntry::new(MANIFEST_FILE_NAME, md5)
                .with_size(size)
                .with_local_path(path))
        })
        .await?;

        // Every staged entry now points into the cache.
        if let Some(staging) = self.staging.take() {
            let path = staging.path().to_path_buf();
            if let Err(e) = staging.close() {
                warn!("Failed to remove staging dir {}: {}", path.display(), e);
            }
        }

        info!(
            "Finalized artifact {} ({} files, digest {})",
            self.name,
            self.manifest.len(),
            digest
        );
        Ok(FinalizedArtifact {
            digest,
            l0_entries: vec![l0],
            manifest_json: self.manifest.to_manifest_json(true)?,
        })
    }

    /// Points staged entries at their cache copies.
    async fn move_staged_into_cache(&mut self) -> Result<()> {
        let Some(staging) = self.staging.as_ref().map(|d| d.path().to_path_buf()) else {
            return Ok(());
        };
        let staged: Vec<(String, String, u64, PathBuf)> = self
            .manifest
            .entries()
            .filter_map(|e| {
                let local = e.local_path.as_ref()?;
                local.starts_with(&staging).then(|| {
                    (
                        e.path.clone(),
                        e.digest.clone(),
                        e.size.unwrap_or(0),
                        local.clone(),
                    )
                })
            })
            .collect();
        if staged.is_empty() {
            return Ok(());
        }

        let cache = self.cache.clone();
        let moved = blocking(move || {
            staged
                .into_iter()
                .map(|(path, digest, size, src)| {
                    copy_into_cache(&cache, &digest, size, &src).map(|dest| (path, dest))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await?;

        for (path, dest) in moved {
            if let Some(entry) = self.manifest.get_entry_mut(&path) {
                entry.local_path = Some(dest);
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artifact_type(&self) -> &str {
        &self.artifact_type
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn policy(&self) -> &Arc<StoragePolicy> {
        &self.policy
    }

    /// Finalizes the artifact if needed.
    pub async fn digest(&mut self) -> Result<String> {
        Ok(self.finalize().await?.digest.clone())
    }

    pub fn is_finalized(&self) -> bool {
        self.is_final
    }

    /// Total bytes of entries with a known size.
    pub fn size(&self) -> u64 {
        self.manifest.size()
    }
}
