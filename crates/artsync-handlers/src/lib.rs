//! Storage handlers for artsync
//!
//! One handler per reference scheme, composed by [`MultiHandler`]:
//! - `file://` local files and directories
//! - `s3://` and `gs://` versioned object stores
//! - `http://` and `https://` plain downloads
//! - anything else is tracked by URI only

pub mod gcs;
pub mod handler;
pub mod http;
pub mod local;
pub mod multi;
pub mod object_store;
pub mod s3;
pub mod tracking;
pub mod versioned;

pub use gcs::GcsClient;
pub use handler::{DEFAULT_MAX_OBJECTS, LoadedPath, StorageHandler, StorePathOptions};
pub use http::HttpHandler;
pub use local::LocalFileHandler;
pub use multi::MultiHandler;
pub use object_store::{ObjectInfo, ObjectStoreClient};
pub use s3::{S3Client, S3Settings};
pub use tracking::TrackingHandler;
pub use versioned::{ObjectStoreFlavor, ObjectStoreHandler};
