//! Scheme-dispatching handler registry

use std::collections::HashMap;
use std::sync::Arc;

use artsync_core::{Error, ManifestEntry, ParsedUri, Result};
use async_trait::async_trait;

use crate::handler::{LoadedPath, StorageHandler, StorePathOptions, entry_ref};

#[derive(Default, Clone)]
pub struct MultiHandler {
    handlers: HashMap<String, Arc<dyn StorageHandler>>,
    default: Option<Arc<dyn StorageHandler>>,
}

impl MultiHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under its own scheme, replacing any previous one.
    pub fn register(mut self, handler: Arc<dyn StorageHandler>) -> Self {
        self.handlers.insert(handler.scheme().to_string(), handler);
        self
    }

    /// Handler used for schemes nobody registered.
    pub fn with_default(mut self, handler: Arc<dyn StorageHandler>) -> Self {
        self.default = Some(handler);
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn handler_for(&self, uri: &str) -> Result<&Arc<dyn StorageHandler>> {
        let scheme = ParsedUri::parse(uri).scheme;
        self.handlers
            .get(scheme)
            .or(self.default.as_ref())
            .ok_or_else(|| Error::SchemeNotRecognized {
                uri: uri.to_string(),
                scheme: scheme.to_string(),
            })
    }
}

#[async_trait]
impl StorageHandler for MultiHandler {
    fn scheme(&self) -> &str {
        ""
    }

    async fn store_path(
        &self,
        uri: &str,
        options: &StorePathOptions,
    ) -> Result<Vec<ManifestEntry>> {
        self.handler_for(uri)?.store_path(uri, options).await
    }

    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        let uri = entry_ref(entry)?;
        self.handler_for(uri)?.load_path(entry, local).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::TrackingHandler;

    struct FixedHandler(&'static str);

    #[async_trait]
    impl StorageHandler for FixedHandler {
        fn scheme(&self) -> &str {
            self.0
        }

        async fn store_path(
            &self,
            uri: &str,
            _options: &StorePathOptions,
        ) -> Result<Vec<ManifestEntry>> {
            Ok(vec![ManifestEntry::new(self.0, uri).with_reference(uri)])
        }

        async fn load_path(&self, entry: &ManifestEntry, _local: bool) -> Result<LoadedPath> {
            Ok(LoadedPath::Reference(format!("{}:{}", self.0, entry.path)))
        }
    }

    #[tokio::test]
    async fn test_dispatch_by_scheme() {
        let multi = MultiHandler::new()
            .register(Arc::new(FixedHandler("s3")))
            .register(Arc::new(FixedHandler("gs")));

        let entries = multi
            .store_path("gs://bucket/key", &StorePathOptions::default())
            .await
            .unwrap();
        assert_eq!(entries[0].path, "gs");

        let loaded = multi.load_path(&entries[0], false).await.unwrap();
        assert_eq!(loaded, LoadedPath::Reference("gs:gs".into()));
    }

    #[tokio::test]
    async fn test_unknown_scheme_without_default() {
        let multi = MultiHandler::new().register(Arc::new(FixedHandler("s3")));
        let err = multi
            .store_path("ftp://host/file", &StorePathOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SchemeNotRecognized { scheme, .. } if scheme == "ftp"));
    }

    #[tokio::test]
    async fn test_unknown_scheme_uses_default() {
        let multi = MultiHandler::new()
            .register(Arc::new(FixedHandler("s3")))
            .with_default(Arc::new(TrackingHandler::new()));
        let entries = multi
            .store_path("ftp://host/file", &StorePathOptions::named("file"))
            .await
            .unwrap();
        assert_eq!(entries[0].digest, "ftp://host/file");
    }
}
