//! Local content cache for artsync
//!
//! This crate provides:
//! - A content-addressed disk cache keyed by MD5 or by (URI, checksum)
//! - Atomic publication of cache files (temp file, then rename)
//! - Size-bounded eviction

pub mod cache;
pub mod error;

pub use cache::{CacheOpener, CacheWriter, ContentCache, WriteMode};
pub use error::{CacheError, Result};
