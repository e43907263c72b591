//! The commit protocol: create the version, upload the manifest file and
//! every owned entry, then commit.

use std::sync::Arc;
use std::time::Duration;

use artsync_core::{
    ArtifactState, CreateArtifactInput, Error, Manifest, ManifestEntry, Result, parse_aliases,
};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::artifact::{Artifact, FinalizedArtifact};
use crate::backend::ArtifactBackend;
use crate::http::ProgressFn;
use crate::policy::StoragePolicy;
use crate::prepare::{BatchSettings, StepPrepare};
use crate::pusher::{CommitHandle, FilePusher, OnCommit, SaveState, StoreFn};

#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub artifact_type: String,
    pub name: String,
    pub metadata: Option<Value>,
    pub description: Option<String>,
    pub aliases: Vec<String>,
    pub labels: Option<Vec<String>>,
    pub entity: Option<String>,
    pub project: Option<String>,
    pub run_name: Option<String>,
    /// Mark the artifact as used by the run once committed.
    pub use_after_commit: bool,
    pub is_user_created: bool,
}

impl SaveOptions {
    /// Type, name, description, metadata and aliases taken from `artifact`.
    pub fn for_artifact(artifact: &Artifact) -> Self {
        Self {
            artifact_type: artifact.artifact_type().to_string(),
            name: artifact.name().to_string(),
            metadata: artifact.metadata().cloned(),
            description: artifact.description().map(str::to_string),
            aliases: artifact.aliases().to_vec(),
            ..Self::default()
        }
    }
}

pub struct ArtifactSaver {
    backend: Arc<dyn ArtifactBackend>,
    pusher: Arc<dyn FilePusher>,
    policy: Arc<StoragePolicy>,
    digest: String,
    l0_entries: Vec<ManifestEntry>,
    manifest: Manifest,
    batch: BatchSettings,
}

impl ArtifactSaver {
    pub fn new(
        backend: Arc<dyn ArtifactBackend>,
        pusher: Arc<dyn FilePusher>,
        policy: Arc<StoragePolicy>,
        finalized: FinalizedArtifact,
    ) -> Result<Self> {
        let manifest = Manifest::from_manifest_json(&finalized.manifest_json)?;
        Ok(Self {
            backend,
            pusher,
            policy,
            digest: finalized.digest,
            l0_entries: finalized.l0_entries,
            manifest,
            batch: BatchSettings::default(),
        })
    }

    pub fn with_batch_settings(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub async fn save(&self, options: SaveOptions) -> Result<SaveHandle> {
        let input = CreateArtifactInput {
            artifact_type_name: options.artifact_type.clone(),
            artifact_collection_name: options.name.clone(),
            digest: self.digest.clone(),
            client_id: uuid::Uuid::new_v4().simple().to_string(),
            sequence_client_id: uuid::Uuid::new_v4().simple().to_string(),
            entity_name: options.entity.clone(),
            project_name: options.project.clone(),
            run_name: options.run_name.clone(),
            description: options.description.clone(),
            metadata: options.metadata.clone(),
            aliases: parse_aliases(&options.name, &options.aliases),
            labels: options.labels.clone(),
            is_user_created: options.is_user_created,
        };
        let server = self.backend.create_artifact(input).await?;
        let artifact_id = server.id;

        match server.state {
            ArtifactState::Pending => {}
            ArtifactState::Committed | ArtifactState::Committing => {
                info!(
                    "Artifact {} already exists with digest {}",
                    options.name, self.digest
                );
                if options.use_after_commit {
                    self.backend.use_artifact(&artifact_id).await?;
                }
                return Ok(SaveHandle {
                    artifact_id,
                    commit: CommitHandle::finished(SaveState::Committed),
                });
            }
            other => return Err(Error::UnexpectedState(other.as_str().to_string())),
        }

        for entry in &self.l0_entries {
            let local_path = entry.local_path.as_deref().ok_or_else(|| {
                Error::Other(anyhow::anyhow!("Manifest file {} was not written", entry.path))
            })?;
            self.pusher
                .file_changed(&entry.path, local_path, &artifact_id, true)
                .await?;
        }

        let preparer = Arc::new(StepPrepare::new(self.backend.clone(), self.batch.clone()));
        preparer.start().await;

        let store_fn: StoreFn = {
            let policy = self.policy.clone();
            let preparer = preparer.clone();
            let artifact_id = artifact_id.clone();
            Arc::new(move |mut entry: ManifestEntry, progress: Option<ProgressFn>| {
                let policy = policy.clone();
                let preparer = preparer.clone();
                let artifact_id = artifact_id.clone();
                async move {
                    policy
                        .store_file(&artifact_id, None, &mut entry, preparer.as_ref(), progress)
                        .await
                }
                .boxed()
            })
        };
        self.pusher
            .store_manifest_files(&self.manifest, &artifact_id, store_fn)
            .await?;

        let on_commit: OnCommit = {
            let backend = self.backend.clone();
            let artifact_id = artifact_id.clone();
            let use_after_commit = options.use_after_commit;
            Box::new(move || {
                async move {
                    if use_after_commit {
                        backend.use_artifact(&artifact_id).await?;
                    }
                    preparer.shutdown().await;
                    Ok(())
                }
                .boxed()
            })
        };
        let commit = self
            .pusher
            .commit_artifact(&artifact_id, Some(on_commit))
            .await?;
        debug!("Queued artifact {} for commit", artifact_id);

        Ok(SaveHandle {
            artifact_id,
            commit,
        })
    }
}

/// Tracks a save that may still be uploading.
#[derive(Clone)]
pub struct SaveHandle {
    pub artifact_id: String,
    commit: CommitHandle,
}

impl SaveHandle {
    pub fn state(&self) -> SaveState {
        self.commit.state()
    }

    /// Waits for the commit. A timeout only stops the wait; uploads carry on.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<String> {
        let mut commit = self.commit.clone();
        let state = match timeout {
            Some(limit) => tokio::time::timeout(limit, commit.wait())
                .await
                .map_err(|_| Error::Timeout(limit))?,
            None => commit.wait().await,
        };
        match state {
            SaveState::Committed => Ok(self.artifact_id.clone()),
            SaveState::Failed(msg) => Err(Error::Backend(msg)),
            SaveState::Cancelled => Err(Error::Cancelled),
            SaveState::Pending => Err(Error::Other(anyhow::anyhow!(
                "Save of {} ended without a result",
                self.artifact_id
            ))),
        }
    }

    pub fn cancel(&self) {
        self.commit.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::http::{RetryPolicy, RetryingClient};
    use crate::pusher::UploadQueue;
    use artsync_handlers::{LocalFileHandler, MultiHandler, TrackingHandler};
    use artsync_storage::ContentCache;
    use axum::Router;
    use axum::body::Bytes;
    use axum::extract::Path as AxumPath;
    use axum::http::StatusCode;
    use axum::routing::put;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type Uploads = Arc<Mutex<HashMap<String, Bytes>>>;

    async fn upload_server(status: StatusCode) -> (String, Uploads) {
        let uploads: Uploads = Arc::new(Mutex::new(HashMap::new()));
        let sink = uploads.clone();
        let app = Router::new().route(
            "/upload/:digest",
            put(move |AxumPath(digest): AxumPath<String>, body: Bytes| {
                let sink = sink.clone();
                async move {
                    if status.is_success() {
                        sink.lock().unwrap().insert(digest, body);
                    }
                    status
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/upload", addr), uploads)
    }

    struct Setup {
        dir: TempDir,
        policy: Arc<StoragePolicy>,
        backend: Arc<MemoryBackend>,
        pusher: Arc<UploadQueue>,
    }

    fn setup(upload_base: &str) -> Setup {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(ContentCache::new(dir.path().join("cache")).unwrap());
        let handlers = MultiHandler::new()
            .register(Arc::new(LocalFileHandler::new(cache.clone())))
            .with_default(Arc::new(TrackingHandler::new()));
        let client = RetryingClient::new(
            reqwest::Client::new(),
            RetryPolicy {
                max_retries: 0,
                backoff_factor: Duration::from_millis(1),
            },
        );
        let policy = Arc::new(StoragePolicy::new(
            cache,
            handlers,
            client.clone(),
            "http://127.0.0.1:1",
            None,
        ));
        let backend = Arc::new(MemoryBackend::new().with_upload_base(upload_base));
        let pusher = Arc::new(UploadQueue::new(backend.clone(), client, 8));
        Setup {
            dir,
            policy,
            backend,
            pusher,
        }
    }

    impl Setup {
        async fn finalized(&self, files: &[(&str, &str)]) -> (Artifact, FinalizedArtifact) {
            let mut artifact = Artifact::new(
                "dataset-v",
                "dataset",
                self.policy.clone(),
                self.policy.cache().clone(),
            )
            .unwrap()
            .with_aliases(vec!["latest".into(), "other:best".into()]);
            for (name, content) in files {
                let path = self.dir.path().join(name);
                std::fs::write(&path, content).unwrap();
                artifact.add_file(&path, None).await.unwrap();
            }
            let finalized = artifact.finalize().await.unwrap().clone();
            (artifact, finalized)
        }

        fn saver(&self, finalized: FinalizedArtifact) -> ArtifactSaver {
            ArtifactSaver::new(
                self.backend.clone(),
                self.pusher.clone(),
                self.policy.clone(),
                finalized,
            )
            .unwrap()
        }
    }

    #[tokio::test]
    async fn test_save_uploads_and_commits() {
        let (base, uploads) = upload_server(StatusCode::OK).await;
        let setup = setup(&base);
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello"), ("b.txt", "world")]).await;
        let mut options = SaveOptions::for_artifact(&artifact);
        options.use_after_commit = true;

        let handle = setup.saver(finalized.clone()).save(options).await.unwrap();
        let id = handle.wait(Some(Duration::from_secs(10))).await.unwrap();

        assert_eq!(handle.state(), SaveState::Committed);
        assert_eq!(setup.backend.artifact_state(&id), Some(ArtifactState::Committed));
        assert_eq!(setup.backend.used(), vec![id.clone()]);
        // manifest file plus two content files
        assert_eq!(uploads.lock().unwrap().len(), 3);

        let created = &setup.backend.created()[0];
        assert_eq!(created.digest, finalized.digest);
        assert_eq!(created.aliases.len(), 2);
        assert_eq!(created.aliases[0].artifact_collection_name, "dataset-v");
        assert_eq!(created.aliases[1].artifact_collection_name, "other");
        assert_eq!(created.aliases[1].alias, "best");
        assert_ne!(created.client_id, created.sequence_client_id);
    }

    #[tokio::test]
    async fn test_existing_artifact_short_circuits() {
        let (base, uploads) = upload_server(StatusCode::OK).await;
        let setup = setup(&base);
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello")]).await;

        let first = setup
            .saver(finalized.clone())
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .unwrap();
        first.wait(None).await.unwrap();
        let uploaded = uploads.lock().unwrap().len();

        let second = setup
            .saver(finalized)
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .unwrap();
        assert_eq!(second.state(), SaveState::Committed);
        assert_eq!(second.artifact_id, first.artifact_id);
        assert_eq!(uploads.lock().unwrap().len(), uploaded);
    }

    #[tokio::test]
    async fn test_deleted_state_is_rejected() {
        let (base, _) = upload_server(StatusCode::OK).await;
        let setup = setup(&base);
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello")]).await;
        setup.backend.force_state(ArtifactState::Deleted);

        let err = setup
            .saver(finalized)
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .err()
            .unwrap();
        match err {
            Error::UnexpectedState(state) => assert_eq!(state, "DELETED"),
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_type_conflict_fails_before_upload() {
        let (base, uploads) = upload_server(StatusCode::OK).await;
        let setup = setup(&base);
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello")]).await;
        let handle = setup
            .saver(finalized)
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .unwrap();
        handle.wait(None).await.unwrap();
        let uploaded = uploads.lock().unwrap().len();
        let prepared = setup.backend.prepared_files();

        let (artifact, finalized) = setup.finalized(&[("b.txt", "weights")]).await;
        let mut options = SaveOptions::for_artifact(&artifact);
        options.artifact_type = "model".into();
        let err = setup.saver(finalized).save(options).await.err().unwrap();

        assert!(matches!(err, Error::TypeConflict { .. }));
        assert_eq!(err.kind(), artsync_core::ErrorKind::Usage);
        assert_eq!(setup.backend.prepared_files(), prepared);
        assert_eq!(uploads.lock().unwrap().len(), uploaded);
    }

    #[tokio::test]
    async fn test_upload_failure_surfaces_on_wait() {
        let (base, _) = upload_server(StatusCode::FORBIDDEN).await;
        let setup = setup(&base);
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello")]).await;

        let handle = setup
            .saver(finalized)
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .unwrap();
        let err = handle.wait(Some(Duration::from_secs(10))).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        assert!(matches!(handle.state(), SaveState::Failed(_)));
        assert_eq!(
            setup.backend.artifact_state(&handle.artifact_id),
            Some(ArtifactState::Pending)
        );
    }

    #[tokio::test]
    async fn test_wait_timeout_is_not_fatal() {
        let app = Router::new().route(
            "/upload/:digest",
            put(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                StatusCode::OK
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let setup = setup(&format!("http://{}/upload", addr));
        let (artifact, finalized) = setup.finalized(&[("a.txt", "hello")]).await;
        let handle = setup
            .saver(finalized)
            .save(SaveOptions::for_artifact(&artifact))
            .await
            .unwrap();

        let err = handle.wait(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(!err.is_fatal());
        handle.cancel();
    }
}
