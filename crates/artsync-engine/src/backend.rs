//! Backend API the save protocol talks to.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use artsync_core::hash::b64_to_hex;
use artsync_core::{
    ArtifactState, CreateArtifactInput, Error, FileSpec, PrepareResponse, Result, ServerArtifact,
};
use async_trait::async_trait;

/// Artifact metadata service: creates versions, hands out upload slots and
/// commits finished versions.
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    async fn create_artifact(&self, input: CreateArtifactInput) -> Result<ServerArtifact>;

    /// Records that the current run consumed the artifact.
    async fn use_artifact(&self, artifact_id: &str) -> Result<()>;

    /// One response per spec, in order.
    async fn create_artifact_files(&self, files: Vec<FileSpec>) -> Result<Vec<PrepareResponse>>;

    async fn commit_artifact(&self, artifact_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredArtifact {
    collection: String,
    artifact_type: String,
    digest: String,
    state: ArtifactState,
    files: Vec<(String, String)>,
}

#[derive(Default)]
struct MemoryState {
    artifacts: Vec<StoredArtifact>,
    /// md5 -> artifact that first uploaded it
    births: HashMap<String, String>,
    committed_md5: HashSet<String>,
    created: Vec<CreateArtifactInput>,
    used: Vec<String>,
    prepare_batches: usize,
    prepared_files: usize,
    forced_state: Option<ArtifactState>,
}

/// In-process backend. Artifacts are deduplicated by collection and digest,
/// a collection keeps the type it was first created with,
/// content already committed by any artifact gets no upload URL, and new
/// content is sent to `{upload_base}/{hex md5}` when an upload base is set.
#[derive(Default)]
pub struct MemoryBackend {
    upload_base: Option<String>,
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_upload_base(mut self, base: impl Into<String>) -> Self {
        self.upload_base = Some(base.into().trim_end_matches('/').to_string());
        self
    }

    /// Every subsequent `create_artifact` reports `state`.
    pub fn force_state(&self, state: ArtifactState) {
        self.lock().forced_state = Some(state);
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn artifact_state(&self, artifact_id: &str) -> Option<ArtifactState> {
        let state = self.lock();
        index_of(artifact_id).and_then(|i| state.artifacts.get(i).map(|a| a.state.clone()))
    }

    /// `(name, md5)` pairs prepared for the artifact.
    pub fn artifact_files(&self, artifact_id: &str) -> Vec<(String, String)> {
        let state = self.lock();
        index_of(artifact_id)
            .and_then(|i| state.artifacts.get(i).map(|a| a.files.clone()))
            .unwrap_or_default()
    }

    pub fn created(&self) -> Vec<CreateArtifactInput> {
        self.lock().created.clone()
    }

    pub fn used(&self) -> Vec<String> {
        self.lock().used.clone()
    }

    pub fn prepare_batches(&self) -> usize {
        self.lock().prepare_batches
    }

    pub fn prepared_files(&self) -> usize {
        self.lock().prepared_files
    }
}

fn artifact_id(index: usize) -> String {
    format!("art-{}", index + 1)
}

fn index_of(artifact_id: &str) -> Option<usize> {
    artifact_id
        .strip_prefix("art-")
        .and_then(|n| n.parse::<usize>().ok())
        .and_then(|n| n.checked_sub(1))
}

fn not_found(artifact_id: &str) -> Error {
    Error::Backend(format!("Artifact {} not found", artifact_id))
}

#[async_trait]
impl ArtifactBackend for MemoryBackend {
    async fn create_artifact(&self, input: CreateArtifactInput) -> Result<ServerArtifact> {
        let mut state = self.lock();
        state.created.push(input.clone());

        if let Some(other) = state.artifacts.iter().find(|a| {
            a.collection == input.artifact_collection_name
                && a.artifact_type != input.artifact_type_name
        }) {
            return Err(Error::TypeConflict {
                name: input.artifact_collection_name.clone(),
                existing: other.artifact_type.clone(),
                requested: input.artifact_type_name.clone(),
            });
        }

        let existing = state.artifacts.iter().position(|a| {
            a.collection == input.artifact_collection_name && a.digest == input.digest
        });
        let index = match existing {
            Some(index) => index,
            None => {
                state.artifacts.push(StoredArtifact {
                    collection: input.artifact_collection_name.clone(),
                    artifact_type: input.artifact_type_name.clone(),
                    digest: input.digest.clone(),
                    state: ArtifactState::Pending,
                    files: Vec::new(),
                });
                state.artifacts.len() - 1
            }
        };

        let reported = match &state.forced_state {
            Some(forced) => forced.clone(),
            None => state.artifacts[index].state.clone(),
        };
        Ok(ServerArtifact {
            id: artifact_id(index),
            state: reported,
        })
    }

    async fn use_artifact(&self, artifact_id: &str) -> Result<()> {
        self.lock().used.push(artifact_id.to_string());
        Ok(())
    }

    async fn create_artifact_files(&self, files: Vec<FileSpec>) -> Result<Vec<PrepareResponse>> {
        let mut state = self.lock();
        state.prepare_batches += 1;
        state.prepared_files += files.len();

        let mut responses = Vec::with_capacity(files.len());
        for spec in files {
            let index = index_of(&spec.artifact_id)
                .filter(|i| *i < state.artifacts.len())
                .ok_or_else(|| not_found(&spec.artifact_id))?;
            state.artifacts[index]
                .files
                .push((spec.name.clone(), spec.md5.clone()));

            let birth = state
                .births
                .entry(spec.md5.clone())
                .or_insert_with(|| spec.artifact_id.clone())
                .clone();

            let upload_url = match &self.upload_base {
                Some(base) if !state.committed_md5.contains(&spec.md5) => {
                    Some(format!("{}/{}", base, b64_to_hex(&spec.md5)?))
                }
                _ => None,
            };
            responses.push(PrepareResponse {
                upload_url,
                upload_headers: vec![format!("Content-MD5:{}", spec.md5)],
                birth_artifact_id: Some(birth),
            });
        }
        Ok(responses)
    }

    async fn commit_artifact(&self, artifact_id: &str) -> Result<()> {
        let mut state = self.lock();
        let index = index_of(artifact_id)
            .filter(|i| *i < state.artifacts.len())
            .ok_or_else(|| not_found(artifact_id))?;
        state.artifacts[index].state = ArtifactState::Committed;
        let md5s: Vec<String> = state.artifacts[index]
            .files
            .iter()
            .map(|(_, md5)| md5.clone())
            .collect();
        state.committed_md5.extend(md5s);
        Ok(())
    }
}
