//! Core domain models for artsync
//!
//! This crate contains:
//! - The manifest model and its digest
//! - Backend record types (artifact state, prepare requests)
//! - Hashing and URI helpers shared by every other crate
//! - The error taxonomy

pub mod artifact;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod uri;

pub use artifact::{
    AliasSpec, ArtifactState, CreateArtifactInput, FileSpec, PrepareResponse, ServerArtifact,
    parse_aliases, validate_name,
};
pub use error::{Error, ErrorKind, Result};
pub use manifest::{Manifest, ManifestEntry, StoragePolicyConfig};
pub use uri::ParsedUri;
