//! Image manifest and config documents.
//!
//! Only the fields the builder reads or rewrites are typed. Everything else
//! is carried through `extra` so a rewritten document keeps the original's
//! remaining content.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::digest;

/// Name of the manifest file in a Directory Transport layout.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Content descriptor for a config or layer blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub size: u64,
    pub digest: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Descriptor {
    pub fn new(media_type: &str, size: u64, digest: &str) -> Self {
        Self {
            media_type: Some(media_type.to_string()),
            size,
            digest: digest.to_string(),
            extra: Map::new(),
        }
    }

    /// File name of the blob inside a Directory Transport layout.
    pub fn blob_name(&self) -> &str {
        digest::strip_prefix(&self.digest)
    }
}

/// Image manifest. `layers` is ordered base-first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `rootfs` section of an image config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub kind: String,
    pub diff_ids: Vec<String>,
}

/// Image configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    pub rootfs: RootFs,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An image materialized in a local Directory Transport layout.
#[derive(Debug, Clone)]
pub struct OriginImage {
    pub manifest: Manifest,
    pub config: ImageConfig,
    /// Directory holding `manifest.json` and every blob.
    pub blob_dir: PathBuf,
}

/// Owned copies handed to the metadata image builder, which rewrites them.
#[derive(Debug, Clone)]
pub struct MetadataSource {
    pub manifest: Manifest,
    pub config: ImageConfig,
}

/// What the rootfs merger needs: the untouched layer list and where the
/// layer blobs live.
#[derive(Debug, Clone)]
pub struct RootfsSource {
    pub layers: Vec<Descriptor>,
    pub blob_dir: PathBuf,
}

impl RootfsSource {
    /// Path of every layer blob, base layer first.
    pub fn layer_paths(&self) -> Vec<PathBuf> {
        self.layers
            .iter()
            .map(|layer| self.blob_dir.join(layer.blob_name()))
            .collect()
    }
}

impl OriginImage {
    /// Read `manifest.json` and the config blob it references from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let raw = fs::read(&manifest_path)
            .with_context(|| format!("Failed to read {}", manifest_path.display()))?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .with_context(|| format!("Malformed manifest {}", manifest_path.display()))?;

        let config_path = dir.join(manifest.config.blob_name());
        let raw = fs::read(&config_path)
            .with_context(|| format!("Failed to read image config {}", config_path.display()))?;
        let config: ImageConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("Malformed image config {}", config_path.display()))?;

        Ok(Self {
            manifest,
            config,
            blob_dir: dir.to_path_buf(),
        })
    }

    /// Split into the metadata builder's copy and the rootfs merger's view.
    ///
    /// This is the only point where the two pipelines diverge; after it,
    /// rewriting the metadata copy cannot affect the layers being merged.
    pub fn split(self) -> (MetadataSource, RootfsSource) {
        let rootfs = RootfsSource {
            layers: self.manifest.layers.clone(),
            blob_dir: self.blob_dir,
        };
        let metadata = MetadataSource {
            manifest: self.manifest,
            config: self.config,
        };
        (metadata, rootfs)
    }
}
