//! Artifact staging and the save protocol
//!
//! - [`Artifact`] builds and finalizes a manifest
//! - [`StoragePolicy`] routes content through handlers, the cache and HTTP
//! - [`ArtifactSaver`] runs create, prepare, upload and commit against an
//!   [`ArtifactBackend`] with a [`FilePusher`] moving the bytes

pub mod artifact;
pub mod backend;
pub mod http;
pub mod policy;
pub mod prepare;
pub mod pusher;
pub mod saver;

pub use artifact::{Artifact, FinalizedArtifact, MANIFEST_FILE_NAME};
pub use backend::{ArtifactBackend, MemoryBackend};
pub use http::{ProgressFn, RetryPolicy, RetryingClient};
pub use policy::{
    PolicySettings, STORAGE_POLICY_NAME, StorageLayout, StoragePolicy, default_handlers,
};
pub use prepare::{BatchSettings, Preparer, StepPrepare};
pub use pusher::{CommitHandle, FilePusher, OnCommit, SaveState, StoreFn, UploadQueue};
pub use saver::{ArtifactSaver, SaveHandle, SaveOptions};
