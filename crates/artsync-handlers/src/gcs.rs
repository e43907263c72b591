//! Google Cloud Storage client over the JSON API.

use std::io::Write;

use artsync_core::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use crate::object_store::{ObjectInfo, ObjectStoreClient};

pub const DEFAULT_GCS_ENDPOINT: &str = "https://storage.googleapis.com";
const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    etag: Option<String>,
    #[serde(default)]
    generation: Option<String>,
}

impl From<GcsObject> for ObjectInfo {
    fn from(obj: GcsObject) -> Self {
        ObjectInfo {
            key: obj.name,
            size: obj.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            etag: obj.etag,
            md5: obj.md5_hash,
            version_id: obj.generation,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GcsVersioning {
    #[serde(default)]
    enabled: bool,
}

#[derive(Debug, Deserialize)]
struct GcsBucket {
    #[serde(default)]
    versioning: Option<GcsVersioning>,
}

pub struct GcsClient {
    http: reqwest::Client,
    endpoint: String,
    access_token: Option<String>,
}

impl GcsClient {
    pub fn new(http: reqwest::Client, access_token: Option<String>) -> Self {
        Self::with_endpoint(http, DEFAULT_GCS_ENDPOINT, access_token)
    }

    pub fn with_endpoint(
        http: reqwest::Client,
        endpoint: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            access_token,
        }
    }

    /// `{endpoint}/storage/v1/b/{bucket}[/o[/{object}]]` with each segment escaped.
    fn url(&self, bucket: &str, object: Option<&str>, list: bool) -> Result<Url> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Other(anyhow::anyhow!("Invalid GCS endpoint: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::Other(anyhow::anyhow!("GCS endpoint cannot be a base")))?;
            segments.pop_if_empty().extend(["storage", "v1", "b", bucket]);
            if list || object.is_some() {
                segments.push("o");
            }
            if let Some(object) = object {
                segments.push(object);
            }
        }
        Ok(url)
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        let mut request = self.http.get(url.clone());
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .map_err(|e| Error::Http(format!("GCS request {} failed: {}", url, e)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<Option<T>> {
        let response = self.get(url.clone()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        let parsed = response
            .json::<T>()
            .await
            .map_err(|e| Error::Http(format!("Invalid GCS response from {}: {}", url, e)))?;
        Ok(Some(parsed))
    }

    async fn list_pages(
        &self,
        bucket: &str,
        prefix: &str,
        versions: bool,
        limit: usize,
        skip_empty: bool,
    ) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = self.url(bucket, None, true)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                let page = LIST_PAGE_SIZE.min(limit.saturating_sub(objects.len())).max(1);
                query.append_pair("maxResults", &page.to_string());
                if versions {
                    query.append_pair("versions", "true");
                }
                if let Some(token) = page_token.take() {
                    query.append_pair("pageToken", &token);
                }
            }
            let Some(page) = self.get_json::<GcsObjectList>(url).await? else {
                break;
            };
            objects.extend(
                page.items
                    .into_iter()
                    .map(ObjectInfo::from)
                    .filter(|obj| !skip_empty || obj.size > 0),
            );
            if objects.len() >= limit {
                objects.truncate(limit);
                break;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(objects)
    }
}

#[async_trait]
impl ObjectStoreClient for GcsClient {
    async fn head(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
    ) -> Result<Option<ObjectInfo>> {
        let mut url = self.url(bucket, Some(key), false)?;
        if let Some(generation) = version {
            url.query_pairs_mut().append_pair("generation", generation);
        }
        Ok(self.get_json::<GcsObject>(url).await?.map(ObjectInfo::from))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        limit: usize,
        skip_empty: bool,
    ) -> Result<Vec<ObjectInfo>> {
        self.list_pages(bucket, prefix, false, limit, skip_empty).await
    }

    async fn list_versions(&self, bucket: &str, key: &str) -> Result<Vec<ObjectInfo>> {
        let all = self.list_pages(bucket, key, true, usize::MAX, false).await?;
        Ok(all.into_iter().filter(|o| o.key == key).collect())
    }

    async fn versioning_enabled(&self, bucket: &str) -> Result<bool> {
        let mut url = self.url(bucket, None, false)?;
        url.query_pairs_mut().append_pair("fields", "versioning");
        let bucket = self.get_json::<GcsBucket>(url).await?;
        Ok(bucket
            .and_then(|b| b.versioning)
            .map(|v| v.enabled)
            .unwrap_or(false))
    }

    async fn download(
        &self,
        bucket: &str,
        key: &str,
        version: Option<&str>,
        out: &mut (dyn Write + Send),
    ) -> Result<u64> {
        let mut url = self.url(bucket, Some(key), false)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("alt", "media");
            if let Some(generation) = version {
                query.append_pair("generation", generation);
            }
        }
        let response = self.get(url.clone()).await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let mut total = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Http(format!("GCS download {}: {}", url, e)))?;
            out.write_all(&chunk)?;
            total += chunk.len() as u64;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use std::collections::HashMap;

    #[test]
    fn test_object_urls_escape_names() {
        let client = GcsClient::new(reqwest::Client::new(), None);
        let url = client.url("bucket", Some("dir/file name.txt"), false).unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/storage/v1/b/bucket/o/dir%2Ffile%20name.txt"
        );
        let list = client.url("bucket", None, true).unwrap();
        assert_eq!(list.as_str(), "https://storage.googleapis.com/storage/v1/b/bucket/o");
    }

    #[test]
    fn test_object_metadata_parsing() {
        let json = serde_json::json!({
            "name": "dir/file.txt",
            "size": "1234",
            "md5Hash": "XUFAKrxLKna5cZ2REBfFkg==",
            "etag": "CKih16GjycICEAE=",
            "generation": "1596051640000000"
        });
        let obj: GcsObject = serde_json::from_value(json).unwrap();
        let info = ObjectInfo::from(obj);
        assert_eq!(info.size, 1234);
        assert_eq!(info.md5.as_deref(), Some("XUFAKrxLKna5cZ2REBfFkg=="));
        assert_eq!(info.version_id.as_deref(), Some("1596051640000000"));
    }

    async fn object(
        Path((bucket, object)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> impl IntoResponse {
        if bucket != "bucket" || object != "dir/file.txt" {
            return AxumStatus::NOT_FOUND.into_response();
        }
        if query.get("alt").map(String::as_str) == Some("media") {
            return "hello".into_response();
        }
        axum::Json(serde_json::json!({
            "name": object,
            "size": "5",
            "md5Hash": "XUFAKrxLKna5cZ2REBfFkg==",
            "etag": "etag1",
            "generation": "7"
        }))
        .into_response()
    }

    async fn spawn_server() -> String {
        let app = Router::new().route("/storage/v1/b/:bucket/o/:object", get(object));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_head_and_download_against_server() {
        let endpoint = spawn_server().await;
        let client = GcsClient::with_endpoint(reqwest::Client::new(), endpoint, None);

        let info = client.head("bucket", "dir/file.txt", None).await.unwrap().unwrap();
        assert_eq!(info.size, 5);
        assert_eq!(info.version_id.as_deref(), Some("7"));
        assert!(client.head("bucket", "missing", None).await.unwrap().is_none());

        let mut out = Vec::new();
        let written = client
            .download("bucket", "dir/file.txt", None, &mut out)
            .await
            .unwrap();
        assert_eq!(written, 5);
        assert_eq!(out, b"hello");
    }
}
