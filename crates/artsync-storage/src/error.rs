//! Error types for artsync-storage

use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache directory {path} is not writable: {source}")]
    NotWritable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid cache key digest: {0}")]
    InvalidDigest(String),

    #[error("Cache files are opened for writing only, mode \"{0}\" is not supported")]
    InvalidMode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<CacheError> for artsync_core::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(e) => artsync_core::Error::Io(e),
            CacheError::InvalidDigest(d) => artsync_core::Error::InvalidDigest(d),
            CacheError::InvalidMode(m) => artsync_core::Error::InvalidMode(m),
            CacheError::NotWritable { path, source } => artsync_core::Error::Other(
                anyhow::Error::new(source)
                    .context(format!("cache directory {} is not writable", path.display())),
            ),
            CacheError::Other(e) => artsync_core::Error::Other(e),
        }
    }
}
