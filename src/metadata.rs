//! Metadata image construction.
//!
//! The metadata image carries the original image configuration but none of
//! its filesystem: its history is replaced by a fixed placeholder rootfs and
//! its single layer is a small, pre-known auxiliary blob. The real filesystem
//! identity lives in the rootfs hash instead.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::digest;
use crate::image::{Descriptor, MetadataSource, RootFs, MANIFEST_FILE};
use crate::tools::{BlobDownloader, ImageTransfer};

/// Name of the Directory Transport version marker.
pub const VERSION_FILE: &str = "version";
/// Content of the version marker.
pub const DIRECTORY_TRANSPORT_VERSION: &str = "Directory Transport Version: 1.1";

/// The auxiliary layer every metadata image points at.
pub const META_LAYER_MEDIA_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const META_LAYER_SIZE: u64 = 2_807_669;
pub const META_LAYER_DIGEST: &str =
    "sha256:c1d6d1b2d5a367259e6e51a7f4d1ccd66a28cc9940d6599d8a8ea9544dd4b4a8";
/// Uncompressed diff id of the auxiliary layer.
pub const META_LAYER_DIFF_ID: &str =
    "sha256:18eb8b5891f2056b0a6c9978359916a519e8fdeec08c13c6383b922cd15fcfb2";
/// Where the auxiliary layer is downloaded from unless configured otherwise.
pub const DEFAULT_META_LAYER_URL: &str = "http://172.28.117.33:30080/public/others/alpine/c1d6d1b2d5a367259e6e51a7f4d1ccd66a28cc9940d6599d8a8ea9544dd4b4a8";

const TEMP_CONFIG_NAME: &str = "temp.json";

/// Placeholder rootfs written into every metadata config.
pub fn placeholder_rootfs() -> RootFs {
    RootFs {
        kind: "layers".to_string(),
        diff_ids: vec![META_LAYER_DIFF_ID.to_string()],
    }
}

/// Descriptor of the auxiliary layer.
pub fn meta_layer() -> Descriptor {
    Descriptor::new(META_LAYER_MEDIA_TYPE, META_LAYER_SIZE, META_LAYER_DIGEST)
}

/// A metadata image laid out on disk, ready to be exported.
#[derive(Debug, Clone)]
pub struct MetadataImage {
    pub dir: PathBuf,
    /// Content address of the rewritten config.
    pub config_digest: String,
    pub config_size: u64,
}

/// Build the metadata image directory at `dir` from the builder's own copy
/// of the manifest and config.
pub fn build_metadata_image(
    downloader: &dyn BlobDownloader,
    source: MetadataSource,
    dir: &Path,
    meta_layer_url: &str,
) -> Result<MetadataImage> {
    let MetadataSource {
        mut manifest,
        mut config,
    } = source;

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    config.rootfs = placeholder_rootfs();
    let config_bytes = serde_json::to_vec(&config).context("Failed to serialize image config")?;
    let stored = digest::store_content_addressed(dir, TEMP_CONFIG_NAME, &config_bytes)?;
    tracing::debug!(digest = %stored.hex, size = stored.size, "Stored metadata config");

    manifest.layers = vec![meta_layer()];
    manifest.config.digest = digest::prefixed(&stored.hex);
    manifest.config.size = stored.size;
    let manifest_bytes = serde_json::to_vec(&manifest).context("Failed to serialize manifest")?;
    fs::write(dir.join(MANIFEST_FILE), manifest_bytes)
        .with_context(|| format!("Failed to write {}", MANIFEST_FILE))?;

    fs::write(dir.join(VERSION_FILE), DIRECTORY_TRANSPORT_VERSION)
        .with_context(|| format!("Failed to write {}", VERSION_FILE))?;

    let layer_path = dir.join(digest::strip_prefix(META_LAYER_DIGEST));
    downloader
        .download(meta_layer_url, &layer_path)
        .context("Failed to download metadata layer")?;

    Ok(MetadataImage {
        dir: dir.to_path_buf(),
        config_digest: manifest.config.digest,
        config_size: stored.size,
    })
}

/// Serialize the metadata image into a portable archive tagged `mref`.
pub fn export_metadata_archive(
    transfer: &dyn ImageTransfer,
    image: &MetadataImage,
    archive: &Path,
    mref: &str,
) -> Result<()> {
    transfer
        .copy_to_archive(&image.dir, archive, Some(mref))
        .with_context(|| format!("Failed to export metadata image as {}", mref))
}
