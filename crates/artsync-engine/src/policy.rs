//! The storage policy ties handlers, the content cache and the HTTP client
//! together and decides where owned content lives on the backend.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use artsync_config::Config;
use artsync_core::hash::b64_to_hex;
use artsync_core::{Error, FileSpec, ManifestEntry, Result, StoragePolicyConfig};
use artsync_handlers::{
    GcsClient, HttpHandler, LoadedPath, LocalFileHandler, MultiHandler, ObjectStoreFlavor,
    ObjectStoreHandler, S3Client, S3Settings, StorageHandler, StorePathOptions, TrackingHandler,
};
use artsync_storage::{ContentCache, WriteMode};
use futures_util::StreamExt;
use reqwest::Url;
use serde_json::{Map, Value};
use tracing::debug;

use crate::http::{ProgressFn, RetryingClient};
use crate::prepare::Preparer;

pub const STORAGE_POLICY_NAME: &str = "wandb-storage-policy-v1";
pub const DEFAULT_REGION: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageLayout {
    /// `artifacts/{entity}/{md5}`
    #[default]
    V1,
    /// `artifactsV2/{region}/{entity}/{birth artifact}/{md5}`
    V2,
}

impl StorageLayout {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageLayout::V1 => "V1",
            StorageLayout::V2 => "V2",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "V1" => Ok(StorageLayout::V1),
            "V2" => Ok(StorageLayout::V2),
            other => Err(Error::Other(anyhow::anyhow!(
                "Unknown storage layout \"{}\"",
                other
            ))),
        }
    }
}

/// Policy settings recorded in every manifest.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PolicySettings {
    pub layout: StorageLayout,
    pub region: Option<String>,
}

impl PolicySettings {
    /// Reads the settings a manifest was written with. Fails for any policy
    /// other than [`STORAGE_POLICY_NAME`].
    pub fn from_storage_policy(policy: &StoragePolicyConfig) -> Result<Self> {
        if policy.name != STORAGE_POLICY_NAME {
            return Err(Error::UnknownStoragePolicy(policy.name.clone()));
        }
        let layout = match policy.config.get("storageLayout") {
            Some(Value::String(layout)) => StorageLayout::parse(layout)?,
            Some(Value::Null) | None => StorageLayout::V1,
            Some(other) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "storageLayout must be a string, got {}",
                    other
                )));
            }
        };
        let region = match policy.config.get("storageRegion") {
            Some(Value::String(region)) if !region.trim().is_empty() => Some(region.clone()),
            Some(Value::Null) | None => None,
            Some(other) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "storageRegion must be a non-empty string, got {}",
                    other
                )));
            }
        };
        Ok(Self { layout, region })
    }

    pub fn to_storage_policy(&self) -> StoragePolicyConfig {
        let mut config = Map::new();
        config.insert(
            "storageLayout".into(),
            Value::String(self.layout.as_str().into()),
        );
        if let Some(region) = &self.region {
            config.insert("storageRegion".into(), Value::String(region.clone()));
        }
        StoragePolicyConfig::new(STORAGE_POLICY_NAME, config)
    }
}

pub struct StoragePolicy {
    settings: PolicySettings,
    cache: Arc<ContentCache>,
    handlers: MultiHandler,
    client: RetryingClient,
    base_url: String,
    api_key: Option<String>,
}

/// The standard handler set: object stores, plain HTTP and local files, with
/// everything else tracked by URI.
pub async fn default_handlers(
    config: &Config,
    cache: Arc<ContentCache>,
    client: &reqwest::Client,
) -> MultiHandler {
    let s3 = S3Client::new(&S3Settings {
        endpoint_url: config.s3.endpoint_url.clone(),
        region: config.s3.region.clone(),
        force_path_style: config.s3.endpoint_url.is_some(),
    })
    .await;
    let gcs = GcsClient::new(client.clone(), config.gcs.access_token.clone());

    MultiHandler::new()
        .register(Arc::new(ObjectStoreHandler::new(
            ObjectStoreFlavor::S3,
            Arc::new(s3),
            cache.clone(),
        )))
        .register(Arc::new(ObjectStoreHandler::new(
            ObjectStoreFlavor::Gcs,
            Arc::new(gcs),
            cache.clone(),
        )))
        .register(Arc::new(HttpHandler::new("http", client.clone(), cache.clone())))
        .register(Arc::new(HttpHandler::new("https", client.clone(), cache.clone())))
        .register(Arc::new(LocalFileHandler::new(cache)))
        .with_default(Arc::new(TrackingHandler::new()))
}

impl StoragePolicy {
    pub fn new(
        cache: Arc<ContentCache>,
        handlers: MultiHandler,
        client: RetryingClient,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            settings: PolicySettings::default(),
            cache,
            handlers,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }

    pub fn with_settings(mut self, settings: PolicySettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn from_config(config: &Config) -> Result<Self> {
        let cache = Arc::new(ContentCache::new(config.cache_dir.clone())?);
        let client = RetryingClient::from_config(&config.http)?;
        let handlers = default_handlers(config, cache.clone(), client.inner()).await;
        Ok(Self::new(
            cache,
            handlers,
            client,
            config.backend.base_url.clone(),
            config.backend.api_key.clone(),
        ))
    }

    pub fn config(&self) -> StoragePolicyConfig {
        self.settings.to_storage_policy()
    }

    pub fn settings(&self) -> &PolicySettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn client(&self) -> &RetryingClient {
        &self.client
    }

    /// Download location of an owned entry.
    pub fn file_url(&self, entity: &str, entry: &ManifestEntry) -> Result<Url> {
        let md5_hex = b64_to_hex(&entry.digest)?;
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| Error::Other(anyhow::anyhow!("Invalid base URL {}: {}", self.base_url, e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Other(anyhow::anyhow!("Base URL cannot be a base")))?;
            segments.pop_if_empty();
            match self.settings.layout {
                StorageLayout::V1 => {
                    segments.extend(["artifacts", entity, md5_hex.as_str()]);
                }
                StorageLayout::V2 => {
                    let region = self.settings.region.as_deref().unwrap_or(DEFAULT_REGION);
                    let birth = entry.birth_artifact_id.as_deref().unwrap_or("");
                    segments.extend(["artifactsV2", region, entity, birth, md5_hex.as_str()]);
                }
            }
        }
        Ok(url)
    }

    /// Returns the cached copy of an owned entry, downloading it on a miss.
    pub async fn load_file(&self, entity: &str, entry: &ManifestEntry) -> Result<PathBuf> {
        let (path, hit, opener) = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.size.unwrap_or(0))?;
        if hit {
            return Ok(path);
        }

        let url = self.file_url(entity, entry)?;
        let api_key = self.api_key.clone().unwrap_or_default();
        let response = self
            .client
            .send(|client| Ok(client.get(url.clone()).basic_auth("api", Some(&api_key))))
            .await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let mut writer = opener.open(WriteMode::Truncate)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Http(format!("Download of {} failed: {}", url, e)))?;
            writer.write_all(&chunk)?;
        }
        let path = writer.commit()?;
        debug!("Downloaded {} to {}", entry.path, path.display());
        Ok(path)
    }

    pub async fn store_reference(
        &self,
        uri: &str,
        options: &StorePathOptions,
    ) -> Result<Vec<ManifestEntry>> {
        self.handlers.store_path(uri, options).await
    }

    pub async fn load_reference(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        self.handlers.load_path(entry, local).await
    }

    /// Uploads an owned entry. Returns true when the backend already had
    /// the content and nothing was sent.
    pub async fn store_file(
        &self,
        artifact_id: &str,
        manifest_id: Option<&str>,
        entry: &mut ManifestEntry,
        preparer: &dyn Preparer,
        progress: Option<ProgressFn>,
    ) -> Result<bool> {
        let cache_path = self.write_through(entry).await?;
        entry.local_path = Some(cache_path.clone());

        let response = preparer
            .prepare(FileSpec {
                artifact_id: artifact_id.to_string(),
                artifact_manifest_id: manifest_id.map(str::to_string),
                name: entry.path.clone(),
                md5: entry.digest.clone(),
            })
            .await?;
        entry.birth_artifact_id = response.birth_artifact_id;

        let Some(upload_url) = response.upload_url else {
            debug!("{} already stored", entry.path);
            return Ok(true);
        };
        self.client
            .upload_file(&upload_url, &response.upload_headers, &cache_path, progress)
            .await?;
        debug!("Uploaded {}", entry.path);
        Ok(false)
    }

    /// Makes sure the cache holds the entry's bytes. The source may be gone
    /// if the cache already has them.
    async fn write_through(&self, entry: &ManifestEntry) -> Result<PathBuf> {
        let (path, hit, opener) = self
            .cache
            .check_md5_obj_path(&entry.digest, entry.size.unwrap_or(0))?;
        if hit {
            return Ok(path);
        }
        let source = entry.local_path.clone().ok_or_else(|| {
            Error::Other(anyhow::anyhow!("Entry {} has no local file", entry.path))
        })?;
        tokio::task::spawn_blocking(move || opener.copy_from(&source))
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Cache copy task failed: {}", e)))?
            .map_err(Error::from)
    }
}
