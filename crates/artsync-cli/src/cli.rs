use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "artsync")]
#[command(about = "Content-addressed artifact staging and upload", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Inspect and trim the local artifact cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Build and inspect manifests
    #[command(subcommand)]
    Manifest(ManifestCommands),
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// Evict cached objects until the cache fits in TARGET_SIZE
    Cleanup {
        /// Target size, e.g. 500MB or 2GiB
        target_size: String,

        /// Leave temporary write files in place
        #[arg(long)]
        keep_temp: bool,
    },

    /// Show where an object with this digest would be cached
    Path {
        /// Base64 MD5 digest
        digest: String,

        /// Size in bytes
        size: u64,
    },
}

#[derive(Subcommand)]
pub enum ManifestCommands {
    /// Build an artifact from a directory and print its manifest
    Build {
        /// Directory to add
        dir: PathBuf,

        /// Artifact name
        #[arg(long)]
        name: String,

        /// Artifact type
        #[arg(long = "type")]
        artifact_type: String,

        /// Reference URIs to track alongside the directory
        #[arg(long)]
        reference: Vec<String>,
    },

    /// Print the digest of a manifest file
    Digest {
        /// Path to a manifest JSON file
        manifest: PathBuf,
    },
}
