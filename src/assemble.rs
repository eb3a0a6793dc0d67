//! Final artifact identity and output config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::digest;

/// Identity of the whole external image.
///
/// The `%` before the metadata hash is part of the established identity
/// format and must stay.
pub fn compose_identity(metadata_hash: &str, rootfs_hash: &str) -> String {
    digest::hash_bytes(format!("%{} {}", metadata_hash, rootfs_hash))
}

/// Metadata image section of `config.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRef {
    pub sha256: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// `config.json` describing an external image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactConfig {
    pub id: String,
    pub architecture: String,
    pub os: String,
    /// Rootfs identity.
    pub sha256: String,
    pub metadata: MetadataRef,
}

/// Output files written by [`assemble_artifact`].
#[derive(Debug, Clone)]
pub struct AssemblyPaths<'a> {
    pub metadata_archive: &'a Path,
    pub config: &'a Path,
    pub identity: &'a Path,
}

/// Hash the metadata archive, compose the identity and write `config.json`
/// plus the standalone identity file.
pub fn assemble_artifact(
    paths: &AssemblyPaths<'_>,
    mref: &str,
    rootfs_hash: &str,
    architecture: &str,
) -> Result<ArtifactConfig> {
    let metadata_hash = digest::hash_file(paths.metadata_archive)?;
    let id = compose_identity(&metadata_hash, rootfs_hash);

    let config = ArtifactConfig {
        id,
        architecture: architecture.to_string(),
        os: "linux".to_string(),
        sha256: rootfs_hash.to_string(),
        metadata: MetadataRef {
            sha256: metadata_hash,
            reference: mref.to_string(),
        },
    };

    let json = serde_json::to_vec(&config).context("Failed to serialize config.json")?;
    fs::write(paths.config, json)
        .with_context(|| format!("Failed to write {}", paths.config.display()))?;
    fs::write(paths.identity, &config.id)
        .with_context(|| format!("Failed to write {}", paths.identity.display()))?;

    tracing::info!(id = %config.id, "External image assembled");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn test_identity_is_hash_of_percent_joined_string() {
        let id = compose_identity("aaa", "bbb");
        assert_eq!(id, digest::hash_bytes("%aaa bbb"));
    }

    #[test]
    fn test_identity_is_order_sensitive() {
        assert_ne!(compose_identity("aaa", "bbb"), compose_identity("bbb", "aaa"));
        assert_ne!(compose_identity("aaa", "bbb"), compose_identity("aaa", "bbc"));
        assert_ne!(compose_identity("aaa", "bbb"), compose_identity("aab", "bbb"));
    }

    #[test]
    fn test_assemble_writes_config_and_identity() {
        let temp = TempDir::new().unwrap();
        let archive = temp.path().join("metadata.tar");
        fs::write(&archive, "metadata").unwrap();
        let config_path = temp.path().join("config.json");
        let identity_path = temp.path().join("sha256");

        let config = assemble_artifact(
            &AssemblyPaths {
                metadata_archive: &archive,
                config: &config_path,
                identity: &identity_path,
            },
            "app:1-meta",
            "rootfshash",
            "x86_64",
        )
        .unwrap();

        let metadata_hash = digest::hash_bytes("metadata");
        assert_eq!(config.id, compose_identity(&metadata_hash, "rootfshash"));
        assert_eq!(fs::read_to_string(&identity_path).unwrap(), config.id);

        let json: Value = serde_json::from_slice(&fs::read(&config_path).unwrap()).unwrap();
        assert_eq!(json["id"], config.id.as_str());
        assert_eq!(json["architecture"], "x86_64");
        assert_eq!(json["os"], "linux");
        assert_eq!(json["sha256"], "rootfshash");
        assert_eq!(json["metadata"]["sha256"], metadata_hash.as_str());
        assert_eq!(json["metadata"]["ref"], "app:1-meta");
    }
}
