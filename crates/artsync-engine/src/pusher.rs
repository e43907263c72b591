//! Upload orchestration.
//!
//! [`FilePusher`] is the seam between the save protocol and whatever moves
//! bytes. [`UploadQueue`] is the in-process implementation: every file is a
//! tokio task bounded by a semaphore, and a per-artifact finalizer commits
//! once the last upload lands.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use artsync_core::hash::md5_file_b64;
use artsync_core::{Error, FileSpec, Manifest, ManifestEntry, Result};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::ArtifactBackend;
use crate::http::{ProgressFn, RetryingClient};

/// Stores one owned manifest entry. Resolves to true when the backend
/// already had the content.
pub type StoreFn =
    Arc<dyn Fn(ManifestEntry, Option<ProgressFn>) -> BoxFuture<'static, Result<bool>> + Send + Sync>;

/// Runs after the backend accepted the commit.
pub type OnCommit = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveState {
    Pending,
    Committed,
    Failed(String),
    Cancelled,
}

impl SaveState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SaveState::Pending)
    }
}

/// Observes the outcome of one artifact's uploads and commit.
#[derive(Clone)]
pub struct CommitHandle {
    state: watch::Receiver<SaveState>,
    cancel: CancellationToken,
}

impl CommitHandle {
    /// A handle that is already in its terminal state.
    pub fn finished(state: SaveState) -> Self {
        let (_, rx) = watch::channel(state);
        Self {
            state: rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SaveState {
        self.state.borrow().clone()
    }

    /// Resolves once the state leaves `Pending`.
    pub async fn wait(&mut self) -> SaveState {
        if let Ok(state) = self.state.wait_for(SaveState::is_terminal).await {
            return state.clone();
        }
        // Finalizer dropped without publishing.
        self.state.borrow().clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

#[async_trait]
pub trait FilePusher: Send + Sync {
    /// Queues a standalone file (the serialized manifest) for upload under
    /// `save_name`.
    async fn file_changed(
        &self,
        save_name: &str,
        local_path: &Path,
        artifact_id: &str,
        use_prepare_flow: bool,
    ) -> Result<()>;

    /// Queues every owned entry of `manifest` through `store_fn`.
    async fn store_manifest_files(
        &self,
        manifest: &Manifest,
        artifact_id: &str,
        store_fn: StoreFn,
    ) -> Result<()>;

    /// Commits once everything queued for the artifact has been uploaded.
    async fn commit_artifact(
        &self,
        artifact_id: &str,
        on_commit: Option<OnCommit>,
    ) -> Result<CommitHandle>;
}

struct ArtifactJobs {
    token: CancellationToken,
    tasks: Vec<JoinHandle<Result<()>>>,
}

pub struct UploadQueue {
    backend: Arc<dyn ArtifactBackend>,
    client: RetryingClient,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    jobs: Mutex<HashMap<String, ArtifactJobs>>,
    finalizers: Mutex<Vec<JoinHandle<()>>>,
    uploaded: Arc<AtomicU64>,
}

impl UploadQueue {
    pub fn new(
        backend: Arc<dyn ArtifactBackend>,
        client: RetryingClient,
        max_concurrent_uploads: usize,
    ) -> Self {
        Self {
            backend,
            client,
            permits: Arc::new(Semaphore::new(max_concurrent_uploads.max(1))),
            token: CancellationToken::new(),
            jobs: Mutex::new(HashMap::new()),
            finalizers: Mutex::new(Vec::new()),
            uploaded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bytes sent so far across all artifacts.
    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    /// Cancels every in-flight save.
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    /// Waits for all requested commits to finish.
    pub async fn shutdown(&self) {
        let finalizers = std::mem::take(&mut *lock(&self.finalizers));
        for finalizer in finalizers {
            if let Err(e) = finalizer.await {
                warn!("Commit task failed: {}", e);
            }
        }
    }

    fn progress(&self) -> ProgressFn {
        let uploaded = self.uploaded.clone();
        Arc::new(move |bytes| {
            uploaded.fetch_add(bytes, Ordering::Relaxed);
        })
    }

    fn spawn_job<F>(&self, artifact_id: &str, job: F)
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let mut jobs = lock(&self.jobs);
        let entry = jobs
            .entry(artifact_id.to_string())
            .or_insert_with(|| ArtifactJobs {
                token: self.token.child_token(),
                tasks: Vec::new(),
            });
        let token = entry.token.clone();
        let permits = self.permits.clone();
        entry.tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(Error::Cancelled),
                result = async {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::Cancelled)?;
                    job.await
                } => {
                    if result.is_err() {
                        // Siblings stop early; the finalizer reports the failure.
                        token.cancel();
                    }
                    result
                }
            }
        }));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn upload_prepared(
    backend: Arc<dyn ArtifactBackend>,
    client: RetryingClient,
    spec_name: String,
    path: PathBuf,
    artifact_id: String,
    progress: ProgressFn,
) -> Result<()> {
    let hash_path = path.clone();
    let md5 = tokio::task::spawn_blocking(move || md5_file_b64(&hash_path))
        .await
        .map_err(|e| Error::Other(anyhow::anyhow!("Hash task failed: {}", e)))??;

    let response = backend
        .create_artifact_files(vec![FileSpec {
            artifact_id,
            artifact_manifest_id: None,
            name: spec_name.clone(),
            md5,
        }])
        .await?
        .pop()
        .ok_or_else(|| Error::Backend(format!("No upload slot for {}", spec_name)))?;

    if let Some(url) = response.upload_url {
        client
            .upload_file(&url, &response.upload_headers, &path, Some(progress))
            .await?;
        debug!("Uploaded {}", spec_name);
    }
    Ok(())
}

#[async_trait]
impl FilePusher for UploadQueue {
    async fn file_changed(
        &self,
        save_name: &str,
        local_path: &Path,
        artifact_id: &str,
        use_prepare_flow: bool,
    ) -> Result<()> {
        if !use_prepare_flow {
            return Err(Error::Other(anyhow::anyhow!(
                "Run file uploads are not supported; {} must use the prepare flow",
                save_name
            )));
        }
        let job = upload_prepared(
            self.backend.clone(),
            self.client.clone(),
            save_name.to_string(),
            local_path.to_path_buf(),
            artifact_id.to_string(),
            self.progress(),
        );
        self.spawn_job(artifact_id, job);
        Ok(())
    }

    async fn store_manifest_files(
        &self,
        manifest: &Manifest,
        artifact_id: &str,
        store_fn: StoreFn,
    ) -> Result<()> {
        let mut queued = 0usize;
        for entry in manifest.entries() {
            if entry.is_reference() || entry.local_path.is_none() {
                continue;
            }
            let store_fn = store_fn.clone();
            let entry = entry.clone();
            let progress = self.progress();
            self.spawn_job(artifact_id, async move {
                store_fn(entry, Some(progress)).await.map(|_| ())
            });
            queued += 1;
        }
        debug!("Queued {} files for artifact {}", queued, artifact_id);
        Ok(())
    }

    async fn commit_artifact(
        &self,
        artifact_id: &str,
        on_commit: Option<OnCommit>,
    ) -> Result<CommitHandle> {
        let jobs = lock(&self.jobs)
            .remove(artifact_id)
            .unwrap_or_else(|| ArtifactJobs {
                token: self.token.child_token(),
                tasks: Vec::new(),
            });
        let (tx, rx) = watch::channel(SaveState::Pending);
        let handle = CommitHandle {
            state: rx,
            cancel: jobs.token.clone(),
        };

        let backend = self.backend.clone();
        let artifact_id = artifact_id.to_string();
        let finalizer = tokio::spawn(async move {
            let state = finish(backend, &artifact_id, jobs, on_commit).await;
            match &state {
                SaveState::Committed => info!("Committed artifact {}", artifact_id),
                SaveState::Failed(msg) => warn!("Artifact {} failed: {}", artifact_id, msg),
                SaveState::Cancelled => info!("Artifact {} cancelled", artifact_id),
                SaveState::Pending => {}
            }
            let _ = tx.send(state);
        });
        lock(&self.finalizers).push(finalizer);
        Ok(handle)
    }
}

async fn finish(
    backend: Arc<dyn ArtifactBackend>,
    artifact_id: &str,
    jobs: ArtifactJobs,
    on_commit: Option<OnCommit>,
) -> SaveState {
    let mut failure: Option<String> = None;
    let mut cancelled = false;
    for task in jobs.tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(Error::Cancelled)) => cancelled = true,
            Ok(Err(e)) => {
                failure.get_or_insert_with(|| e.to_string());
            }
            Err(e) => {
                failure.get_or_insert_with(|| format!("Upload task failed: {}", e));
            }
        }
    }
    if let Some(msg) = failure {
        return SaveState::Failed(msg);
    }
    if cancelled || jobs.token.is_cancelled() {
        return SaveState::Cancelled;
    }

    if let Err(e) = backend.commit_artifact(artifact_id).await {
        return SaveState::Failed(e.to_string());
    }
    if let Some(on_commit) = on_commit {
        if let Err(e) = on_commit().await {
            return SaveState::Failed(e.to_string());
        }
    }
    SaveState::Committed
}
