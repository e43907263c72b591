use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

static NAME_RE: LazyLock<Result<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9_\-.]+$").map_err(|e| Error::Other(anyhow::anyhow!(e)))
});

/// Checks an artifact name against the allowed character set.
pub fn validate_name(name: &str) -> Result<()> {
    let re = NAME_RE
        .as_ref()
        .map_err(|e| Error::Other(anyhow::anyhow!("name pattern: {}", e)))?;
    if re.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

/// Lifecycle state of an artifact version on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactState {
    Pending,
    Committing,
    Committed,
    Deleted,
}

impl ArtifactState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactState::Pending => "PENDING",
            ArtifactState::Committing => "COMMITTING",
            ArtifactState::Committed => "COMMITTED",
            ArtifactState::Deleted => "DELETED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerArtifact {
    pub id: String,
    pub state: ArtifactState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasSpec {
    pub artifact_collection_name: String,
    pub alias: String,
}

/// Splits `collection:alias` targets; bare aliases apply to `name`.
pub fn parse_aliases(name: &str, aliases: &[String]) -> Vec<AliasSpec> {
    aliases
        .iter()
        .map(|alias| match alias.split_once(':') {
            Some((collection, tag)) => AliasSpec {
                artifact_collection_name: collection.to_string(),
                alias: tag.to_string(),
            },
            None => AliasSpec {
                artifact_collection_name: name.to_string(),
                alias: alias.clone(),
            },
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArtifactInput {
    pub artifact_type_name: String,
    pub artifact_collection_name: String,
    pub digest: String,
    pub client_id: String,
    pub sequence_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub aliases: Vec<AliasSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
    #[serde(default)]
    pub is_user_created: bool,
}

/// One file the backend is asked to prepare an upload slot for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    #[serde(rename = "artifactID")]
    pub artifact_id: String,
    #[serde(rename = "artifactManifestID", default)]
    pub artifact_manifest_id: Option<String>,
    pub name: String,
    /// Base64 MD5 of the content.
    pub md5: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrepareResponse {
    /// `None` when the backend already holds the content.
    pub upload_url: Option<String>,
    #[serde(default)]
    pub upload_headers: Vec<String>,
    #[serde(rename = "birthArtifactID", default)]
    pub birth_artifact_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-dataset_v1.0").is_ok());
        assert!(matches!(validate_name("bad/name"), Err(Error::InvalidName(_))));
        assert!(validate_name("").is_err());
        assert!(validate_name("spaces are bad").is_err());
    }

    #[test]
    fn test_parse_aliases() {
        let specs = parse_aliases(
            "mnist",
            &["latest".to_string(), "other-coll:best".to_string()],
        );
        assert_eq!(specs[0].artifact_collection_name, "mnist");
        assert_eq!(specs[0].alias, "latest");
        assert_eq!(specs[1].artifact_collection_name, "other-coll");
        assert_eq!(specs[1].alias, "best");
    }

    #[test]
    fn test_state_wire_format() {
        let state: ArtifactState = serde_json::from_str("\"COMMITTING\"").unwrap();
        assert_eq!(state, ArtifactState::Committing);
        assert_eq!(state.as_str(), "COMMITTING");
    }

    #[test]
    fn test_file_spec_wire_names() {
        let spec = FileSpec {
            artifact_id: "a1".into(),
            artifact_manifest_id: None,
            name: "wandb_manifest.json".into(),
            md5: "abc".into(),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["artifactID"], "a1");
        assert_eq!(json["name"], "wandb_manifest.json");
    }
}
