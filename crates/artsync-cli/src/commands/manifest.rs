use anyhow::Result;
use artsync_config::Config;
use artsync_core::Manifest;
use artsync_engine::{Artifact, StoragePolicy};
use std::path::Path;
use std::sync::Arc;

use crate::cli::ManifestCommands;

pub async fn handle(cmd: ManifestCommands, config: &Config) -> Result<()> {
    match cmd {
        ManifestCommands::Build {
            dir,
            name,
            artifact_type,
            reference,
        } => build(config, &dir, name, artifact_type, reference).await,
        ManifestCommands::Digest { manifest } => digest(&manifest),
    }
}

async fn build(
    config: &Config,
    dir: &Path,
    name: String,
    artifact_type: String,
    references: Vec<String>,
) -> Result<()> {
    let policy = Arc::new(StoragePolicy::from_config(config).await?);
    let mut artifact = Artifact::new(name, artifact_type, policy.clone(), policy.cache().clone())?
        .with_hash_workers(config.upload.hash_workers);

    let added = artifact.add_dir(dir, None).await?;
    for uri in &references {
        let entries = artifact.add_reference(uri, None, true, None).await?;
        tracing::debug!("Tracked {} entries from {}", entries.len(), uri);
    }

    let digest = artifact.finalize().await?.digest.clone();
    let manifest = artifact.manifest().to_manifest_json(false)?;

    println!("✓ Built {} ({} files, {} bytes)", artifact.name(), added.len(), artifact.size());
    println!("  Digest: {}", digest);
    println!("{}", serde_json::to_string_pretty(&manifest)?);
    Ok(())
}

fn digest(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let manifest = Manifest::from_json_str(&content)?;
    println!("{}", manifest.digest());
    Ok(())
}
