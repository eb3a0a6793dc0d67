//! Narrow interfaces to the external tools the pipeline drives.
//!
//! Each trait covers one tool family. The host implementations shell out
//! through [`crate::process::Cmd`]; tests substitute in-process fakes so the
//! pipeline can run without skopeo, overlayfs or root.

mod host;

use anyhow::Result;
use std::path::{Path, PathBuf};

pub use host::{Curl, HostLayerTools, Skopeo};

/// Copies images between transports (skopeo).
pub trait ImageTransfer {
    /// Copy `source` (a full transport reference such as
    /// `docker-daemon:alpine:3.19`) into a Directory Transport layout at `dest_dir`.
    fn copy_to_dir(&self, source: &str, dest_dir: &Path) -> Result<()>;

    /// Serialize the Directory Transport layout at `src_dir` into a single
    /// docker-archive file, tagged with `additional_tag` when given.
    fn copy_to_archive(
        &self,
        src_dir: &Path,
        archive: &Path,
        additional_tag: Option<&str>,
    ) -> Result<()>;
}

/// Downloads a fixed blob (curl).
pub trait BlobDownloader {
    fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// An overlay mount request. `lower_dirs` is ordered top-first, the way
/// overlayfs expects its `lowerdir=` option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySpec {
    pub lower_dirs: Vec<PathBuf>,
    pub target: PathBuf,
}

/// Filesystem tools used to flatten layers.
pub trait LayerTools {
    /// Unpack a layer archive into `dest`.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;

    /// Create an overlay whiteout at `path`, hiding the same path in lower layers.
    fn make_whiteout(&self, path: &Path) -> Result<()>;

    /// Mark `dir` opaque so lower layers' contents of it are hidden.
    fn mark_opaque(&self, dir: &Path) -> Result<()>;

    /// Mount a read-only overlay.
    fn mount_overlay(&self, spec: &OverlaySpec) -> Result<()>;

    /// Unmount whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> Result<()>;

    /// Copy `src` to `dest`, preserving modes, ownership and symlinks.
    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Write an uncompressed tar of `parent/name` to `archive`, with entries
    /// rooted at `name/`.
    fn archive_dir(&self, parent: &Path, name: &str, archive: &Path) -> Result<()>;
}

/// The set of tools one pipeline run uses.
#[derive(Clone, Copy)]
pub struct Toolchain<'a> {
    pub transfer: &'a dyn ImageTransfer,
    pub downloader: &'a dyn BlobDownloader,
    pub layers: &'a dyn LayerTools,
}
