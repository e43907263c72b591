//! Reference handler for versioned object stores (`s3://`, `gs://`).
//!
//! Both providers share the same flow and differ only in which object field
//! serves as the checksum and how the cache slot is keyed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use artsync_core::uri::{basename, join};
use artsync_core::{Error, ManifestEntry, ParsedUri, Result};
use artsync_storage::{ContentCache, WriteMode};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::handler::{
    LoadedPath, StorageHandler, StorePathOptions, entry_ref, relative_to, too_many,
};
use crate::object_store::{ObjectInfo, ObjectStoreClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreFlavor {
    /// ETag is the checksum; cache keyed by (URI, ETag).
    S3,
    /// Content MD5 is the checksum; cache keyed by MD5.
    Gcs,
}

impl ObjectStoreFlavor {
    pub fn default_scheme(&self) -> &'static str {
        match self {
            ObjectStoreFlavor::S3 => "s3",
            ObjectStoreFlavor::Gcs => "gs",
        }
    }
}

pub struct ObjectStoreHandler {
    scheme: String,
    flavor: ObjectStoreFlavor,
    client: Arc<dyn ObjectStoreClient>,
    cache: Arc<ContentCache>,
    versioning: Mutex<HashMap<String, bool>>,
}

fn strip_quotes(etag: &str) -> &str {
    etag.trim_matches('"')
}

impl ObjectStoreHandler {
    pub fn new(
        flavor: ObjectStoreFlavor,
        client: Arc<dyn ObjectStoreClient>,
        cache: Arc<ContentCache>,
    ) -> Self {
        Self {
            scheme: flavor.default_scheme().to_string(),
            flavor,
            client,
            cache,
            versioning: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    fn checksum_of(&self, obj: &ObjectInfo) -> String {
        let etag = obj.etag.as_deref().map(strip_quotes);
        match self.flavor {
            ObjectStoreFlavor::S3 => etag.unwrap_or_default().to_string(),
            ObjectStoreFlavor::Gcs => obj
                .md5
                .as_deref()
                .or(etag)
                .unwrap_or_default()
                .to_string(),
        }
    }

    fn extra_of(&self, obj: &ObjectInfo) -> Map<String, Value> {
        let mut extra = Map::new();
        if let Some(etag) = &obj.etag {
            let etag = match self.flavor {
                ObjectStoreFlavor::S3 => strip_quotes(etag),
                ObjectStoreFlavor::Gcs => etag.as_str(),
            };
            extra.insert("etag".into(), Value::String(etag.to_string()));
        }
        if let Some(version) = obj.version_id.as_deref().filter(|v| *v != "null") {
            extra.insert("versionID".into(), Value::String(version.to_string()));
        }
        extra
    }

    fn entry_from_obj(
        &self,
        obj: &ObjectInfo,
        uri: &str,
        name: Option<&str>,
        prefix: &str,
        multi: bool,
    ) -> ManifestEntry {
        let below_prefix = obj.key != prefix && obj.key.starts_with(prefix);
        let (path, reference) = match name {
            None if below_prefix => {
                let rel = relative_to(&obj.key, prefix);
                (rel.to_string(), join(uri, rel))
            }
            None => (basename(&obj.key).to_string(), uri.to_string()),
            Some(name) if multi => {
                let rel = relative_to(&obj.key, prefix);
                (join(name, rel), join(uri, rel))
            }
            Some(name) => (name.to_string(), uri.to_string()),
        };
        ManifestEntry::new(path, self.checksum_of(obj))
            .with_reference(reference)
            .with_size(obj.size)
            .with_extra(self.extra_of(obj))
    }

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let cached = self
            .versioning
            .lock()
            .ok()
            .and_then(|m| m.get(bucket).copied());
        if let Some(enabled) = cached {
            return Ok(enabled);
        }
        let enabled = self.client.versioning_enabled(bucket).await?;
        if let Ok(mut map) = self.versioning.lock() {
            map.insert(bucket.to_string(), enabled);
        }
        Ok(enabled)
    }

    /// Picks the object version whose bytes match the entry.
    /// `None` means the latest version.
    async fn resolve_version(
        &self,
        entry: &ManifestEntry,
        uri: &str,
        bucket: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let recorded = entry.extra.get("versionID").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        if let Some(version) = recorded {
            if self.client.head(bucket, key, Some(&version)).await?.is_some() {
                return Ok(Some(version));
            }
            warn!("Version {} of {} is gone, falling back to latest", version, uri);
        }

        let latest = self
            .client
            .head(bucket, key, None)
            .await?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("Object not found: {}", uri)))?;
        let found = self.checksum_of(&latest);
        if found == entry.digest {
            return Ok(None);
        }

        if !self.versioning_enabled(bucket).await? {
            return Err(Error::DigestMismatch {
                uri: uri.to_string(),
                expected: entry.digest.clone(),
                found,
            });
        }

        let wanted = entry
            .extra
            .get("etag")
            .and_then(Value::as_str)
            .map(strip_quotes)
            .unwrap_or(entry.digest.as_str())
            .to_string();
        debug!("Scanning version history of {} for {}", uri, wanted);
        for version in self.client.list_versions(bucket, key).await? {
            let etag = version.etag.as_deref().map(strip_quotes);
            if etag == Some(wanted.as_str()) || self.checksum_of(&version) == entry.digest {
                return Ok(version.version_id);
            }
        }
        Err(Error::VersionNotFound {
            uri: uri.to_string(),
            checksum: wanted,
        })
    }
}

#[async_trait]
impl StorageHandler for ObjectStoreHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn store_path(
        &self,
        uri: &str,
        options: &StorePathOptions,
    ) -> Result<Vec<ManifestEntry>> {
        let parsed = ParsedUri::parse(uri);
        let (bucket, key) = (parsed.netloc, parsed.key());

        if !options.checksum {
            let name = options.name.as_deref().unwrap_or(key);
            return Ok(vec![ManifestEntry::new(name, uri).with_reference(uri)]);
        }

        let single = if key.is_empty() {
            None
        } else {
            self.client.head(bucket, key, None).await?
        };
        let (objects, multi) = match single {
            Some(obj) => (vec![obj], false),
            None => {
                info!(
                    "Generating checksum for up to {} objects with prefix \"{}\"",
                    options.max_objects, key
                );
                // Folder markers must not eat into the limit.
                let skip_empty = self.flavor == ObjectStoreFlavor::S3;
                let listed = self
                    .client
                    .list(bucket, key, options.max_objects.saturating_add(1), skip_empty)
                    .await?;
                (listed, true)
            }
        };

        let entries: Vec<ManifestEntry> = objects
            .iter()
            .filter(|obj| self.flavor != ObjectStoreFlavor::S3 || obj.size > 0)
            .map(|obj| self.entry_from_obj(obj, uri, options.name.as_deref(), key, multi))
            .collect();
        if entries.len() > options.max_objects {
            return Err(too_many(uri, options.max_objects));
        }
        Ok(entries)
    }

    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        let uri = entry_ref(entry)?;
        if !local {
            return Ok(LoadedPath::Reference(uri.to_string()));
        }

        let size = entry.size.unwrap_or(0);
        let (path, hit, opener) = match self.flavor {
            ObjectStoreFlavor::S3 => self.cache.check_etag_obj_path(uri, &entry.digest, size)?,
            ObjectStoreFlavor::Gcs => self.cache.check_md5_obj_path(&entry.digest, size)?,
        };
        if hit {
            return Ok(LoadedPath::Local(path));
        }

        let parsed = ParsedUri::parse(uri);
        let (bucket, key) = (parsed.netloc, parsed.key());
        let version = self.resolve_version(entry, uri, bucket, key).await?;

        let mut writer = opener.open(WriteMode::Truncate)?;
        let written = self
            .client
            .download(bucket, key, version.as_deref(), &mut writer)
            .await?;
        writer.commit()?;
        debug!("Downloaded {} bytes from {}", written, uri);
        Ok(LoadedPath::Local(path))
    }
}
