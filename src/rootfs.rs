//! Rootfs flattening.
//!
//! Every layer is unpacked into its own directory, the directories are
//! stacked as a read-only overlay (base layer at the bottom), and the merged
//! view is copied out and archived as `rootfs.tar`.
//!
//! The rootfs identity is NOT the hash of `rootfs.tar`. Copying through an
//! overlay mount recreates symlinks and inodes, so the archive bytes differ
//! between runs. The identity is the hash of the original layer blobs,
//! concatenated in manifest order.

use anyhow::{bail, Context, Result};
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::digest;
use crate::image::RootfsSource;
use crate::tools::{LayerTools, OverlaySpec};

/// Prefix of an OCI whiteout entry.
pub const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker that makes its directory opaque.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";
/// Prefix of aufs bookkeeping entries (`.wh..wh.plnk`, `.wh..wh.aufs`).
/// These are not whiteouts and never reach the merged tree.
pub const WHITEOUT_META_PREFIX: &str = ".wh..wh.";

/// Empty bottom-most lower dir. A read-only overlay needs at least two
/// lower dirs, so single-layer images still mount.
const BASE_DIR_NAME: &str = "base";

/// Paths the merger works in.
#[derive(Debug, Clone)]
pub struct MergePaths {
    /// Parent of the per-layer directories.
    pub unpack: PathBuf,
    /// Overlay mount point.
    pub mount: PathBuf,
    /// Standalone copy of the merged tree. Must not exist yet.
    pub rootfs: PathBuf,
    /// Output archive.
    pub archive: PathBuf,
}

/// Result of a successful merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRootfs {
    pub archive: PathBuf,
    /// Hash of the concatenated layer blobs.
    pub identity: String,
}

/// A mounted overlay. Unmounted on drop unless [`OverlayMount::unmount`]
/// already did it.
pub struct OverlayMount<'a> {
    tools: &'a dyn LayerTools,
    target: PathBuf,
    mounted: bool,
}

impl<'a> OverlayMount<'a> {
    pub fn mount(tools: &'a dyn LayerTools, spec: &OverlaySpec) -> Result<Self> {
        tools
            .mount_overlay(spec)
            .with_context(|| format!("Failed to mount overlay at {}", spec.target.display()))?;
        Ok(Self {
            tools,
            target: spec.target.clone(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Unmount now, reporting failure to the caller.
    pub fn unmount(mut self) -> Result<()> {
        self.mounted = false;
        self.tools
            .unmount(&self.target)
            .with_context(|| format!("Failed to unmount {}", self.target.display()))
    }
}

impl Drop for OverlayMount<'_> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        self.mounted = false;
        match self.tools.unmount(&self.target) {
            Ok(()) => tracing::debug!(target = %self.target.display(), "Released overlay mount"),
            Err(e) => tracing::error!(
                "Failed to unmount {}: {:#}",
                self.target.display(),
                e
            ),
        }
    }
}

/// Directory a layer is unpacked into. The index keeps repeated digests apart.
pub fn layer_dir(unpack: &Path, index: usize, blob_name: &str) -> PathBuf {
    unpack.join(format!("{:03}-{}", index, blob_name))
}

/// Overlay lower dirs for layers unpacked in base-first order, top-first as
/// overlayfs wants them, with the empty base dir last.
pub fn overlay_lower_dirs(base: &Path, layer_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut lower = Vec::with_capacity(layer_dirs.len() + 1);
    lower.push(base.to_path_buf());
    lower.extend(layer_dirs.iter().cloned());
    lower.reverse();
    lower
}

/// A `.wh.`-prefixed entry found in an unpacked layer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    /// `.wh..wh..opq`: its directory hides lower contents.
    Opaque(PathBuf),
    /// `.wh.<name>`: hides `<name>` in lower layers.
    Whiteout(PathBuf),
    /// aufs bookkeeping, dropped without conversion.
    Meta(PathBuf),
}

fn classify(path: PathBuf, name: &OsStr) -> Option<Marker> {
    let bytes = name.as_bytes();
    if bytes == OPAQUE_MARKER.as_bytes() {
        Some(Marker::Opaque(path))
    } else if bytes.starts_with(WHITEOUT_META_PREFIX.as_bytes()) {
        Some(Marker::Meta(path))
    } else if bytes.starts_with(WHITEOUT_PREFIX.as_bytes()) {
        Some(Marker::Whiteout(path))
    } else {
        None
    }
}

/// Translate OCI whiteout files in an unpacked layer into overlay form.
///
/// `.wh.<name>` becomes an overlay whiteout at `<name>`; `.wh..wh..opq`
/// marks its directory opaque. Other `.wh..wh.` entries are aufs metadata
/// and are deleted, directories included, without being walked. All marker
/// entries are removed from the layer. Returns the number converted.
pub fn convert_whiteouts(tools: &dyn LayerTools, layer_dir: &Path) -> Result<usize> {
    let mut markers = Vec::new();
    let mut walker = WalkDir::new(layer_dir).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("Failed to walk {}", layer_dir.display()))?;
        let is_dir = entry.file_type().is_dir();
        let marker = classify(entry.path().to_path_buf(), entry.file_name());
        if matches!(marker, Some(Marker::Meta(_))) && is_dir {
            walker.skip_current_dir();
        }
        markers.extend(marker);
    }

    let mut converted = 0;
    for marker in markers {
        match marker {
            Marker::Meta(path) => {
                tracing::debug!(path = %path.display(), "Dropping aufs metadata");
                remove_path(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            Marker::Opaque(path) => {
                let parent = marker_parent(&path)?;
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove whiteout {}", path.display()))?;
                tools.mark_opaque(parent)?;
                converted += 1;
            }
            Marker::Whiteout(path) => {
                let parent = marker_parent(&path)?;
                let name = path.file_name().map(OsStr::as_bytes).unwrap_or_default();
                let hidden_name = name.get(WHITEOUT_PREFIX.len()..).unwrap_or_default();
                let hidden = parent.join(OsStr::from_bytes(hidden_name));

                remove_path(&path)
                    .with_context(|| format!("Failed to remove whiteout {}", path.display()))?;
                if hidden.symlink_metadata().is_ok() {
                    remove_path(&hidden)?;
                }
                tools.make_whiteout(&hidden)?;
                converted += 1;
            }
        }
    }

    Ok(converted)
}

fn marker_parent(marker: &Path) -> Result<&Path> {
    marker
        .parent()
        .with_context(|| format!("Whiteout without parent: {}", marker.display()))
}

fn remove_path(path: &Path) -> Result<()> {
    let meta = path.symlink_metadata()?;
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Unpack every layer of `source` into its own directory under `unpack`.
/// Returns the layer directories base-first.
pub fn unpack_layers(
    tools: &dyn LayerTools,
    source: &RootfsSource,
    unpack: &Path,
) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::with_capacity(source.layers.len());
    for (index, (layer, blob)) in source
        .layers
        .iter()
        .zip(source.layer_paths())
        .enumerate()
    {
        let dir = layer_dir(unpack, index, layer.blob_name());
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        tools
            .extract(&blob, &dir)
            .with_context(|| format!("Failed to extract layer {}", layer.digest))?;
        let whiteouts = convert_whiteouts(tools, &dir)?;
        tracing::debug!(layer = %layer.digest, whiteouts, "Unpacked layer");
        dirs.push(dir);
    }
    Ok(dirs)
}

/// Flatten the layers of `source` into `paths.archive`.
pub fn merge_layers(
    tools: &dyn LayerTools,
    source: &RootfsSource,
    paths: &MergePaths,
) -> Result<MergedRootfs> {
    if source.layers.is_empty() {
        bail!("Image has no layers to flatten");
    }

    let base = paths.unpack.join(BASE_DIR_NAME);
    fs::create_dir_all(&base).with_context(|| format!("Failed to create {}", base.display()))?;
    fs::create_dir_all(&paths.mount)
        .with_context(|| format!("Failed to create {}", paths.mount.display()))?;

    let layer_dirs = unpack_layers(tools, source, &paths.unpack)?;
    let spec = OverlaySpec {
        lower_dirs: overlay_lower_dirs(&base, &layer_dirs),
        target: paths.mount.clone(),
    };

    let mount = OverlayMount::mount(tools, &spec)?;
    tools
        .copy_tree(mount.path(), &paths.rootfs)
        .with_context(|| format!("Failed to copy merged tree to {}", paths.rootfs.display()))?;
    archive_rootfs(tools, &paths.rootfs, &paths.archive)?;
    mount.unmount()?;

    let identity = digest::hash_files(&source.layer_paths())?;
    tracing::info!(identity = %identity, layers = source.layers.len(), "Rootfs flattened");

    Ok(MergedRootfs {
        archive: paths.archive.clone(),
        identity,
    })
}

fn archive_rootfs(tools: &dyn LayerTools, rootfs: &Path, archive: &Path) -> Result<()> {
    let parent = rootfs
        .parent()
        .with_context(|| format!("{} has no parent directory", rootfs.display()))?;
    let name = rootfs
        .file_name()
        .with_context(|| format!("{} has no file name", rootfs.display()))?
        .to_string_lossy();
    tools
        .archive_dir(parent, &name, archive)
        .with_context(|| format!("Failed to archive {}", rootfs.display()))
}
