//! Handler for references whose scheme nothing else understands

use artsync_core::{Error, ManifestEntry, ParsedUri, Result};
use async_trait::async_trait;
use tracing::warn;

use crate::handler::{LoadedPath, StorageHandler, StorePathOptions, entry_ref};

/// Records the URI as-is; content is never read or checksummed.
#[derive(Debug, Clone)]
pub struct TrackingHandler {
    scheme: String,
}

impl TrackingHandler {
    pub fn new() -> Self {
        Self::with_scheme("")
    }

    pub fn with_scheme(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
        }
    }
}

impl Default for TrackingHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageHandler for TrackingHandler {
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
            .ok_or_else(|| Error::NameRequired(uri.to_string()))?;
        warn!(
            "Artifact references with unsupported schemes cannot be checksummed: {}",
            uri
        );
        Ok(vec![ManifestEntry::new(name, uri).with_reference(uri)])
    }

    async fn load_path(&self, entry: &ManifestEntry, local: bool) -> Result<LoadedPath> {
        let uri = entry_ref(entry)?;
        if local {
            return Err(Error::SchemeNotRecognized {
                uri: uri.to_string(),
                scheme: ParsedUri::parse(uri).scheme.to_string(),
            });
        }
        Ok(LoadedPath::Reference(uri.to_string()))
    }
}
