//! Batched upload preparation.
//!
//! Every owned file needs an upload slot from the backend before its bytes
//! can be sent. [`StepPrepare`] gathers individual requests into batches so
//! that a directory of thousands of files costs a handful of round trips.

use std::sync::Arc;
use std::time::Duration;

use artsync_config::UploadConfig;
use artsync_core::{Error, FileSpec, PrepareResponse, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::backend::ArtifactBackend;

#[async_trait]
pub trait Preparer: Send + Sync {
    async fn prepare(&self, spec: FileSpec) -> Result<PrepareResponse>;
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    /// Upper bound on how long the first request of a batch waits.
    pub batch_time: Duration,
    /// A batch is flushed once no request arrives for this long.
    pub inter_event_time: Duration,
    pub max_batch_size: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_time: Duration::from_millis(100),
            inter_event_time: Duration::from_millis(10),
            max_batch_size: 1000,
        }
    }
}

impl From<&UploadConfig> for BatchSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            batch_time: Duration::from_millis(config.prepare_batch_time_ms),
            inter_event_time: Duration::from_millis(config.prepare_inter_event_ms),
            max_batch_size: config.prepare_max_batch.max(1),
        }
    }
}

struct Request {
    spec: FileSpec,
    reply: oneshot::Sender<Result<PrepareResponse>>,
}

pub struct StepPrepare {
    backend: Arc<dyn ArtifactBackend>,
    settings: BatchSettings,
    sender: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StepPrepare {
    pub fn new(backend: Arc<dyn ArtifactBackend>, settings: BatchSettings) -> Self {
        Self {
            backend,
            settings,
            sender: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the batching task. Calling it twice is a no-op.
    pub async fn start(&self) {
        let mut sender = self.sender.lock().await;
        if sender.is_some() {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *sender = Some(tx);
        let handle = tokio::spawn(run_batches(
            self.backend.clone(),
            self.settings.clone(),
            rx,
        ));
        *self.worker.lock().await = Some(handle);
    }

    /// Flushes pending requests and stops the batching task.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl Preparer for StepPrepare {
    async fn prepare(&self, spec: FileSpec) -> Result<PrepareResponse> {
        let (reply, response) = oneshot::channel();
        {
            let sender = self.sender.lock().await;
            let sender = sender
                .as_ref()
                .ok_or_else(|| Error::Other(anyhow::anyhow!("Preparer is not running")))?;
            sender
                .send(Request { spec, reply })
                .map_err(|_| Error::Other(anyhow::anyhow!("Preparer has shut down")))?;
        }
        response
            .await
            .map_err(|_| Error::Other(anyhow::anyhow!("Preparer dropped request")))?
    }
}

async fn run_batches(
    backend: Arc<dyn ArtifactBackend>,
    settings: BatchSettings,
    mut rx: mpsc::UnboundedReceiver<Request>,
) {
    while let Some(batch) = gather_batch(&mut rx, &settings).await {
        debug!("Preparing {} files", batch.len());
        let specs = batch.iter().map(|r| r.spec.clone()).collect();
        match backend.create_artifact_files(specs).await {
            Ok(responses) if responses.len() == batch.len() => {
                for (request, response) in batch.into_iter().zip(responses) {
                    let _ = request.reply.send(Ok(response));
                }
            }
            Ok(responses) => {
                let msg = format!(
                    "Backend prepared {} files for a batch of {}",
                    responses.len(),
                    batch.len()
                );
                for request in batch {
                    let _ = request.reply.send(Err(Error::Backend(msg.clone())));
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for request in batch {
                    let _ = request.reply.send(Err(Error::Backend(msg.clone())));
                }
            }
        }
    }
}

/// Waits for one request, then keeps collecting until the batch window
/// closes, the stream goes quiet, or the batch is full. `None` once the
/// channel is closed and drained.
async fn gather_batch(
    rx: &mut mpsc::UnboundedReceiver<Request>,
    settings: &BatchSettings,
) -> Option<Vec<Request>> {
    let first = rx.recv().await?;
    let deadline = Instant::now() + settings.batch_time;
    let mut batch = vec![first];

    while batch.len() < settings.max_batch_size {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let wait = settings.inter_event_time.min(deadline - now);
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(request)) => batch.push(request),
            Ok(None) | Err(_) => break,
        }
    }
    Some(batch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use artsync_core::CreateArtifactInput;

    fn spec(name: &str) -> FileSpec {
        FileSpec {
            artifact_id: "art-1".into(),
            artifact_manifest_id: None,
            name: name.into(),
            md5: "XUFAKrxLKna5cZ2REBfFkg==".into(),
        }
    }

    /// A backend that already holds `art-1`.
    async fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new().with_upload_base("http://uploads"));
        backend
            .create_artifact(CreateArtifactInput {
                artifact_type_name: "dataset".into(),
                artifact_collection_name: "mnist".into(),
                digest: "d1".into(),
                client_id: "c1".into(),
                sequence_client_id: "s1".into(),
                entity_name: None,
                project_name: None,
                run_name: None,
                description: None,
                metadata: None,
                aliases: Vec::new(),
                labels: None,
                is_user_created: false,
            })
            .await
            .unwrap();
        backend
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_a_batch() {
        let backend = backend().await;
        let preparer = Arc::new(StepPrepare::new(
            backend.clone(),
            BatchSettings {
                batch_time: Duration::from_millis(200),
                inter_event_time: Duration::from_millis(50),
                max_batch_size: 100,
            },
        ));
        preparer.start().await;

        let mut tasks = Vec::new();
        for i in 0..10 {
            let preparer = preparer.clone();
            tasks.push(tokio::spawn(async move {
                preparer.prepare(spec(&format!("file{}", i))).await
            }));
        }
        for task in tasks {
            let response = task.await.unwrap().unwrap();
            assert!(response.upload_url.is_some());
        }
        preparer.shutdown().await;

        assert!(backend.prepare_batches() < 10);
        assert_eq!(backend.prepared_files(), 10);
    }

    #[tokio::test]
    async fn test_batch_size_is_bounded() {
        let backend = backend().await;
        let preparer = Arc::new(StepPrepare::new(
            backend.clone(),
            BatchSettings {
                batch_time: Duration::from_secs(1),
                inter_event_time: Duration::from_millis(200),
                max_batch_size: 2,
            },
        ));
        preparer.start().await;

        let mut tasks = Vec::new();
        for i in 0..6 {
            let preparer = preparer.clone();
            tasks.push(tokio::spawn(async move {
                preparer.prepare(spec(&format!("file{}", i))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        preparer.shutdown().await;
        assert!(backend.prepare_batches() >= 3);
    }

    #[tokio::test]
    async fn test_backend_errors_reach_every_request() {
        let preparer = StepPrepare::new(Arc::new(MemoryBackend::new()), BatchSettings::default());
        preparer.start().await;
        let err = preparer.prepare(spec("a")).await.unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
        preparer.shutdown().await;
    }

    #[tokio::test]
    async fn test_prepare_before_start_fails() {
        let preparer = StepPrepare::new(Arc::new(MemoryBackend::new()), BatchSettings::default());
        assert!(preparer.prepare(spec("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_prepare_after_shutdown_fails() {
        let preparer = StepPrepare::new(backend().await, BatchSettings::default());
        preparer.start().await;
        preparer.prepare(spec("a")).await.unwrap();
        preparer.shutdown().await;
        assert!(preparer.prepare(spec("b")).await.is_err());
    }
}
