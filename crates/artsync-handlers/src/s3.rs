//! Amazon S3 client built on the AWS SDK.

use std::io::Write;

use artsync_core::{Error, Result};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::BucketVersioningStatus;
use tokio::io::AsyncReadExt;

use crate::object_store::{ObjectInfo, ObjectStoreClient};

const LIST_PAGE_SIZE: usize = 1000;

/// Connection settings; `None` falls back to the SDK's environment lookup.
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub endpoint_url: Option<String>,
    pub region: Option<String>,
    pub force_path_style: bool,
}

pub struct S3Client {
    client: Client,
}

fn backend_error(op: &str, bucket: &str, key: &str, err: impl std::error::Error) -> Error {
    Error::Backend(format!(
        "S3 {} s3://{}/{}: {}",
        op,
        bucket,
        key,
        DisplayErrorContext(err)
    ))
}

impl S3Client {
    pub async fn new(settings: &S3Settings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = settings.region.clone() {
            loader = loader.region(Region::new(region));
        }
        if let Some(endpoint) = settings.endpoint_url.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if settings.force_path_style {
            builder = builder.force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStoreClient for S3Client {
    async fn head(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        let result = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version.map(str::to_string))
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                etag: output.e_tag().map(str::to_string),
                md5: None,
                version_id: output.version_id().map(str::to_string),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(backend_error("head", bucket, key, err)),
        }
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        skip_empty: bool,
    ) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page_size = LIST_PAGE_SIZE.min(limit.saturating_sub(objects.len())).max(1);
            let output = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .max_keys(page_size as i32)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| backend_error("list", bucket, prefix, e))?;

            for obj in output.contents() {
                let size = obj.size().unwrap_or(0).max(0) as u64;
                if skip_empty && size == 0 {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: obj.key().unwrap_or_default().to_string(),
                    size,
                    etag: obj.e_tag().map(str::to_string),
                    md5: None,
                    version_id: None,
                });
            }

            if objects.len() >= limit {
                objects.truncate(limit);
                break;
            }
            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }
        Ok(objects)
    }

    async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<ObjectInfo>> {
        let mut versions = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut version_marker: Option<String> = None;
        loop {
            let output = self
                .client
                .list_object_versions()
                .bucket(bucket)
                .prefix(key)
                .set_key_marker(key_marker.take())
                .set_version_id_marker(version_marker.take())
                .send()
                .await
                .map_err(|e| backend_error("list versions", bucket, key, e))?;

            versions.extend(
                output
                    .versions()
                    .iter()
                    .filter(|v| v.key() == Some(key))
                    .map(|v| ObjectInfo {
                        key: key.to_string(),
                        size: v.size().unwrap_or(0).max(0) as u64,
                        etag: v.e_tag().map(str::to_string),
                        md5: None,
                        version_id: v.version_id().map(str::to_string),
                    }),
            );

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            version_marker = output.next_version_id_marker().map(str::to_string);
            if key_marker.is_none() && version_marker.is_none() {
                break;
            }
        }
        Ok(versions)
    }

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let output = self
            .client
            .get_bucket_versioning()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| backend_error("get versioning", bucket, "", e))?;
        Ok(output.status() == Some(&BucketVersioningStatus::Enabled))
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        out: &mut (dyn Write + Send),
    ) -> Result<u64> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(version.map(str::to_string))
            .send()
            .await
            .map_err(|e| backend_error("get", bucket, key, e))?;

        let mut reader = output.body.into_async_read();
        let mut chunk = vec![0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let read = reader.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            out.write_all(&chunk[..read])?;
            total += read as u64;
        }
        Ok(total)
    }
}
