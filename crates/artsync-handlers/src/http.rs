use artsync_core::uri::basename;
use artsync_core::{Error, ManifestEntry, ParsedUri, Result};
use artsync_storage::{ContentCache, WriteMode};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, ETAG, HeaderMap};
use serde_json::{Map, Value};
use std::io::Write;
use std::sync::Arc;
use tracing::debug;

use crate::handler::{LoadedPath, StorageHandler, StorePathOptions, entry_ref};

/// Handles plain `http://` and `https://` references.
pub struct HttpHandler {
    scheme: String,
    client: reqwest::Client,
    cache: Arc<ContentCache>,
}

impl HttpHandler {
    pub fn new(scheme: impl Into<String>, client: reqwest::Client, cache: Arc<ContentCache>) -> Self {
        Self {
            scheme: scheme.into(),
            client,
            cache,
        }
    }

    async fn fetch(&self, uri: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(uri)
            .send()
            .await
            .map_err(|e| Error::Http(format!("Failed to fetch {}: {}", uri, e)))?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                url: uri.to_string(),
            });
        }
        Ok(response)
    }
}

/// Digest, size and extra derived from response headers. Digest falls back to
/// the URI when the server sends no ETag.
fn entry_from_headers(uri: &str, headers: &HeaderMap) -> (String, Option<u64>, Map<String, Value>) {
    let size = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let mut extra = Map::new();
    let digest = match headers.get(ETAG).and_then(|v| v.to_str().ok()) {
        Some(etag) => {
            extra.insert("etag".into(), Value::String(etag.to_string()));
            etag.trim_matches('"').to_string()
        }
        None => uri.to_string(),
    };
    (digest, size, extra)
}

#[async_trait]
impl StorageHandler for HttpHandler {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    async fn store_path(
        &self,
        uri: &str,
        options: &StorePathOptions,
    ) -> Result<Vec<ManifestEntry>> {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| basename(ParsedUri::parse(uri).path).to_string());
        if !options.checksum {
            return Ok(vec![ManifestEntry::new(name, uri).with_reference(uri)]);
        }

        let response = self.fetch(uri).await?;
        let (digest, size, extra) = entry_from_headers(uri, response.headers());
        let mut entry = ManifestEntry::new(name, digest)
            .with_reference(uri)
            .with_extra(extra);
        entry.size = size;
        Ok(vec![entry])
    }

    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        let uri = entry_ref(entry)?;
        if !local {
            return Ok(LoadedPath::Reference(uri.to_string()));
        }

        let (path, hit, opener) =
            self.cache
                .check_etag_obj_path(uri, &entry.digest, entry.size.unwrap_or(0))?;
        if hit {
            return Ok(LoadedPath::Local(path));
        }

        let response = self.fetch(uri).await?;
        let (digest, _, _) = entry_from_headers(uri, response.headers());
        if digest != entry.digest {
            return Err(Error::DigestMismatch {
                uri: uri.to_string(),
                expected: entry.digest.clone(),
                found: digest,
            });
        }

        let mut writer = opener.open(WriteMode::Truncate)?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::Http(format!("Download of {} failed: {}", uri, e)))?;
            writer.write_all(&chunk)?;
        }
        writer.commit()?;
        debug!("Cached {} at {}", uri, path.display());
        Ok(LoadedPath::Local(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::header;
    use axum::routing::get;
    use tempfile::TempDir;

    async fn spawn_server() -> String {
        let app = Router::new()
            .route(
                "/files/data.csv",
                get(|| async { ([(header::ETAG, "\"abc123\"")], "a,b\n1,2\n") }),
            )
            .route("/files/plain.txt", get(|| async { "no etag" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn handler() -> (TempDir, HttpHandler) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path().join("cache")).unwrap());
        (dir, HttpHandler::new("http", reqwest::Client::new(), cache))
    }

    #[tokio::test]
    async fn test_store_uses_etag() {
        let base = spawn_server().await;
        let (_dir, handler) = handler();
        let uri = format!("{}/files/data.csv", base);

        let entries = handler.store_path(&uri, &StorePathOptions::default()).await.unwrap();
        assert_eq!(entries[0].path, "data.csv");
        assert_eq!(entries[0].digest, "abc123");
        assert_eq!(entries[0].size, Some(8));
        assert_eq!(entries[0].extra["etag"], Value::String("\"abc123\"".into()));
    }

    #[tokio::test]
    async fn test_store_without_etag_uses_uri() {
        let base = spawn_server().await;
        let (_dir, handler) = handler();
        let uri = format!("{}/files/plain.txt", base);

        let entries = handler.store_path(&uri, &StorePathOptions::named("plain")).await.unwrap();
        assert_eq!(entries[0].path, "plain");
        assert_eq!(entries[0].digest, uri);
    }

    #[tokio::test]
    async fn test_load_downloads_into_cache() {
        let base = spawn_server().await;
        let (_dir, handler) = handler();
        let uri = format!("{}/files/data.csv", base);
        let entry = handler
            .store_path(&uri, &StorePathOptions::default())
            .await
            .unwrap()
            .remove(0);

        let loaded = handler.load_path(&entry, true).await.unwrap();
        let path = loaded.as_local().unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_load_detects_changed_etag() {
        let base = spawn_server().await;
        let (_dir, handler) = handler();
        let uri = format!("{}/files/data.csv", base);
        let entry = ManifestEntry::new("data.csv", "stale").with_reference(&uri).with_size(8);

        let err = handler.load_path(&entry, true).await.unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
    }
}
