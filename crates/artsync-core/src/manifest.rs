//! Versioned content index for an artifact.
//!
//! Entries are keyed by logical path and kept sorted, so serialization and the
//! manifest digest never depend on insertion order.

use std::collections::BTreeMap;
use std::path::PathBuf;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::{Error, Result};

pub const MANIFEST_VERSION: u64 = 1;
const DIGEST_HEADER: &str = "wandb-artifact-manifest-v1\n";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(skip)]
    pub path: String,
    pub digest: String,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(
        rename = "birthArtifactID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub birth_artifact_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Staging location of the bytes; only persisted on request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            digest: digest.into(),
            reference: None,
            birth_artifact_id: None,
            extra: Map::new(),
            size: None,
            local_path: None,
        }
    }

    pub fn with_reference(mut self, uri: impl Into<String>) -> Self {
        self.reference = Some(uri.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn with_local_path(mut self, local_path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(local_path.into());
        self
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }
}

/// Storage policy name plus its opaque configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StoragePolicyConfig {
    pub name: String,
    pub config: Map<String, Value>,
}

impl StoragePolicyConfig {
    pub fn new(name: impl Into<String>, config: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    storage_policy: StoragePolicyConfig,
    entries: BTreeMap<String, ManifestEntry>,
}

impl Manifest {
    pub fn new(storage_policy: StoragePolicyConfig) -> Self {
        Self {
            storage_policy,
            entries: BTreeMap::new(),
        }
    }

    pub fn storage_policy(&self) -> &StoragePolicyConfig {
        &self.storage_policy
    }

    pub fn add_entry(&mut self, mut entry: ManifestEntry) -> Result<()> {
        entry.path = normalize_path(&entry.path);
        if self.entries.contains_key(&entry.path) {
            return Err(Error::DuplicatePath(entry.path));
        }
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn get_entry(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    pub fn get_entry_mut(&mut self, path: &str) -> Option<&mut ManifestEntry> {
        self.entries.get_mut(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    /// Entries in path order.
    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut ManifestEntry> {
        self.entries.values_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the sizes that are known.
    pub fn size(&self) -> u64 {
        self.entries.values().filter_map(|e| e.size).sum()
    }

    /// Lowercase hex MD5 over the header line and one `path:digest` line per
    /// entry, in path order.
    pub fn digest(&self) -> String {
        let mut hasher = Md5::new();
        hasher.update(DIGEST_HEADER.as_bytes());
        for entry in self.entries.values() {
            hasher.update(format!("{}:{}\n", entry.path, entry.digest).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_manifest_json(&self, include_local: bool) -> Result<Value> {
        let mut contents = Map::new();
        for entry in self.entries.values() {
            let mut value = serde_json::to_value(entry)?;
            if !include_local {
                if let Value::Object(obj) = &mut value {
                    obj.remove("local_path");
                }
            }
            contents.insert(entry.path.clone(), value);
        }

        Ok(json!({
            "version": MANIFEST_VERSION,
            "storagePolicy": self.storage_policy.name,
            "storagePolicyConfig": Value::Object(self.storage_policy.config.clone()),
            "contents": Value::Object(contents),
        }))
    }

    pub fn from_manifest_json(value: &Value) -> Result<Self> {
        let version = value.get("version").cloned().unwrap_or(Value::Null);
        if version.as_u64() != Some(MANIFEST_VERSION) {
            return Err(Error::UnsupportedManifestVersion(version));
        }

        let name = value
            .get("storagePolicy")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::UnknownStoragePolicy(String::new()))?;
        let config = match value.get("storagePolicyConfig") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        };

        let mut manifest = Manifest::new(StoragePolicyConfig::new(name, config));
        if let Some(Value::Object(contents)) = value.get("contents") {
            for (path, raw) in contents {
                let mut entry: ManifestEntry = serde_json::from_value(raw.clone())?;
                entry.path = path.clone();
                manifest.add_entry(entry)?;
            }
        }
        Ok(manifest)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(s)?;
        Self::from_manifest_json(&value)
    }
}

/// Logical paths always use forward slashes.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> StoragePolicyConfig {
        let mut config = Map::new();
        config.insert("storageLayout".into(), json!("V2"));
        StoragePolicyConfig::new("wandb-storage-policy-v1", config)
    }

    fn manifest_with(paths: &[(&str, &str)]) -> Manifest {
        let mut manifest = Manifest::new(policy());
        for (path, digest) in paths {
            manifest.add_entry(ManifestEntry::new(*path, *digest)).unwrap();
        }
        manifest
    }

    #[test]
    fn test_digest_is_insertion_order_independent() {
        let a = manifest_with(&[("b.txt", "d2"), ("a.txt", "d1"), ("c/d.txt", "d3")]);
        let b = manifest_with(&[("c/d.txt", "d3"), ("a.txt", "d1"), ("b.txt", "d2")]);
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 32);
    }

    #[test]
    fn test_digest_matches_reference_algorithm() {
        let manifest = manifest_with(&[("a.txt", "abc")]);
        let expected = crate::hash::md5_hex(b"wandb-artifact-manifest-v1\na.txt:abc\n");
        assert_eq!(manifest.digest(), expected);

        let empty = Manifest::new(policy());
        assert_eq!(empty.digest(), crate::hash::md5_hex(b"wandb-artifact-manifest-v1\n"));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut manifest = manifest_with(&[("a.txt", "d1")]);
        let err = manifest
            .add_entry(ManifestEntry::new("a.txt", "other"))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicatePath(p) if p == "a.txt"));
        assert_eq!(manifest.len(), 1);
    }

    #[test]
    fn test_paths_are_forward_slashed() {
        let manifest = manifest_with(&[("dir\\file.txt", "d")]);
        assert!(manifest.contains("dir/file.txt"));
    }

    #[test]
    fn test_json_round_trip() {
        let mut manifest = Manifest::new(policy());
        let mut extra = Map::new();
        extra.insert("etag".into(), json!("abc"));
        extra.insert("versionID".into(), json!("v1"));
        manifest
            .add_entry(
                ManifestEntry::new("ref/obj", "abc")
                    .with_reference("s3://bucket/obj")
                    .with_extra(extra)
                    .with_size(10),
            )
            .unwrap();
        let mut owned = ManifestEntry::new("data.csv", "XUFAKrxLKna5cZ2REBfFkg==")
            .with_size(5)
            .with_local_path("/tmp/staging/data.csv");
        owned.birth_artifact_id = Some("QXJ0aWZhY3Q6MQ==".into());
        manifest.add_entry(owned).unwrap();

        let json = manifest.to_manifest_json(false).unwrap();
        assert_eq!(json["version"], json!(1));
        assert_eq!(json["storagePolicy"], json!("wandb-storage-policy-v1"));
        assert_eq!(json["contents"]["data.csv"]["birthArtifactID"], json!("QXJ0aWZhY3Q6MQ=="));
        assert!(json["contents"]["data.csv"].get("local_path").is_none());
        assert!(json["contents"]["data.csv"].get("extra").is_none());
        assert_eq!(json["contents"]["ref/obj"]["ref"], json!("s3://bucket/obj"));

        let parsed = Manifest::from_manifest_json(&json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.digest(), manifest.digest());
        assert_eq!(parsed.get_entry("ref/obj"), manifest.get_entry("ref/obj"));
        assert_eq!(parsed.get_entry("data.csv").unwrap().local_path, None);
    }

    #[test]
    fn test_local_path_persisted_on_request() {
        let mut manifest = Manifest::new(policy());
        manifest
            .add_entry(ManifestEntry::new("x", "d").with_local_path("/tmp/x"))
            .unwrap();
        let json = manifest.to_manifest_json(true).unwrap();
        let parsed = Manifest::from_manifest_json(&json).unwrap();
        assert_eq!(
            parsed.get_entry("x").unwrap().local_path,
            Some(PathBuf::from("/tmp/x"))
        );
    }

    #[test]
    fn test_rejects_unknown_version() {
        let value = json!({"version": 2, "storagePolicy": "p", "contents": {}});
        let err = Manifest::from_manifest_json(&value).unwrap_err();
        assert!(matches!(err, Error::UnsupportedManifestVersion(v) if v == json!(2)));
    }

    #[test]
    fn test_missing_policy_config_defaults_empty() {
        let value = json!({"version": 1, "storagePolicy": "p", "contents": {"a": {"digest": "d"}}});
        let manifest = Manifest::from_manifest_json(&value).unwrap();
        assert!(manifest.storage_policy().config.is_empty());
        assert_eq!(manifest.get_entry("a").unwrap().digest, "d");
    }

    #[test]
    fn test_size_sums_known_sizes() {
        let mut manifest = Manifest::new(policy());
        manifest.add_entry(ManifestEntry::new("a", "d").with_size(3)).unwrap();
        manifest.add_entry(ManifestEntry::new("b", "d")).unwrap();
        manifest.add_entry(ManifestEntry::new("c", "d").with_size(4)).unwrap();
        assert_eq!(manifest.size(), 7);
    }
}
