use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Usage errors: caller misuse, surfaced synchronously and never retried.
    #[error(
        "Artifact name may only contain alphanumeric characters, dashes, underscores, and dots. Invalid name: \"{0}\""
    )]
    InvalidName(String),

    #[error("type is required when logging artifacts, specify \"dataset\", \"model\", or a custom type")]
    MissingType,

    #[error("Can't add to finalized artifact")]
    Finalized,

    #[error("Duplicate manifest path: {0}")]
    DuplicatePath(String),

    #[error("Path is not a file: {0}")]
    NotAFile(String),

    #[error("Path is not a directory: {0}")]
    NotADirectory(String),

    #[error("Path \"{0}\" must be a valid file or directory path")]
    NotFileOrDirectory(String),

    #[error("File with name \"{0}\" already exists")]
    FileExists(String),

    #[error("File name \"{0}\" must be a relative path inside the artifact")]
    InvalidPath(String),

    #[error("Artifact {name} already exists with type \"{existing}\"; can't save it as \"{requested}\"")]
    TypeConflict {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Exceeded {max_objects} objects tracked under {uri}, pass a larger max_objects to add_reference")]
    TooManyObjects { uri: String, max_objects: usize },

    #[error("References must be URIs. To reference a local file, use file://. Got: {0}")]
    ReferenceNotUri(String),

    #[error("You must pass a name when tracking references with unknown schemes. ref: {0}")]
    NameRequired(String),

    #[error("Cannot download file at path {uri}, scheme \"{scheme}\" not recognized")]
    SchemeNotRecognized { uri: String, scheme: String },

    #[error("Invalid cache open mode: {0}")]
    InvalidMode(String),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    // Integrity errors: recorded content disagrees with what is observed now.
    #[error("Digest mismatch for {uri}: expected {expected} but found {found}")]
    DigestMismatch {
        uri: String,
        expected: String,
        found: String,
    },

    #[error("Couldn't find object version for {uri} matching checksum {checksum}")]
    VersionNotFound { uri: String, checksum: String },

    // Transport errors.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    // Protocol errors.
    #[error("Unknown artifact state \"{0}\"")]
    UnexpectedState(String),

    #[error("Expected manifest version 1, got {0}")]
    UnsupportedManifestVersion(serde_json::Value),

    #[error("Failed to find storage policy \"{0}\"")]
    UnknownStoragePolicy(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Timed out after {0:?} waiting for artifact; uploads continue in the background")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Usage,
    Integrity,
    Transport,
    Protocol,
    Timeout,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidName(_)
            | Error::MissingType
            | Error::Finalized
            | Error::DuplicatePath(_)
            | Error::NotAFile(_)
            | Error::NotADirectory(_)
            | Error::NotFileOrDirectory(_)
            | Error::FileExists(_)
            | Error::InvalidPath(_)
            | Error::TypeConflict { .. }
            | Error::TooManyObjects { .. }
            | Error::ReferenceNotUri(_)
            | Error::NameRequired(_)
            | Error::SchemeNotRecognized { .. }
            | Error::InvalidMode(_)
            | Error::InvalidDigest(_) => ErrorKind::Usage,
            Error::DigestMismatch { .. } | Error::VersionNotFound { .. } => ErrorKind::Integrity,
            Error::Http(_) | Error::HttpStatus { .. } => ErrorKind::Transport,
            Error::UnexpectedState(_)
            | Error::UnsupportedManifestVersion(_)
            | Error::UnknownStoragePolicy(_)
            | Error::Backend(_) => ErrorKind::Protocol,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(_) | Error::Serialization(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// A timeout only means the caller stopped waiting.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
