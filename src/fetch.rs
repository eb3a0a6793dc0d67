//! Materialize the source image into a local Directory Transport layout.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use crate::image::OriginImage;
use crate::tools::ImageTransfer;

/// Default transport prefix: the local docker daemon.
pub const DEFAULT_SOURCE_PREFIX: &str = "docker-daemon:";

/// Where the source image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSource {
    /// Image reference, e.g. `registry.example.com/app:1.2`.
    pub reference: String,
    /// Transport prefix prepended to the reference.
    pub prefix: String,
}

impl ImageSource {
    pub fn new(reference: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            prefix: prefix.into(),
        }
    }

    /// Full transport reference handed to the transfer tool.
    pub fn transport_ref(&self) -> String {
        format!("{}{}", self.prefix, self.reference)
    }
}

/// Fetch `source` into `raw_dir` and load its manifest and config.
///
/// There is no recovery from a partial fetch: any transfer failure aborts.
pub fn fetch_origin(
    transfer: &dyn ImageTransfer,
    source: &ImageSource,
    raw_dir: &Path,
) -> Result<OriginImage> {
    if let Some(parent) = raw_dir.parent() {
        fs::create_dir_all(parent)?;
    }

    transfer
        .copy_to_dir(&source.transport_ref(), raw_dir)
        .with_context(|| format!("Failed to fetch {}", source.transport_ref()))?;

    let image = OriginImage::load(raw_dir)?;
    tracing::info!(
        reference = %source.reference,
        layers = image.manifest.layers.len(),
        "Fetched origin image"
    );
    Ok(image)
}
