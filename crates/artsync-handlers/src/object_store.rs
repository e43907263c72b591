//! Provider-neutral access to versioned object stores.

use std::io::Write;

use artsync_core::Result;
use async_trait::async_trait;

/// Metadata for one object (or one version of it).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    /// Raw ETag as reported by the provider, quotes included.
    pub etag: Option<String>,
    /// Base64 MD5 of the content, when the provider reports one.
    pub md5: Option<String>,
    /// Version id (S3) or generation (GCS).
    pub version_id: Option<String>,
}

/// Low-level object store operations, implemented once per provider.
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Metadata for `key`, or for one specific version. `None` if missing.
    async fn head(&self, bucket: &str, key: &str, version: Option<&str>)
    -> Result<Option<ObjectInfo>>;

    /// Objects under `prefix`, at most `limit` of them. With `skip_empty`,
    /// zero-byte objects are left out and do not count towards `limit`.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        skip_empty: bool,
    ) -> Result<Vec<ObjectInfo>>;

    /// Every stored version of exactly `key`.
    async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<ObjectInfo>>;

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool>;

    /// Streams the object into `out`, returning the number of bytes written.
    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        out: &mut (dyn Write + Send),
    ) -> Result<u64>;
}
