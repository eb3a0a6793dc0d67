//! The run-scoped `build/` directory tree.
//!
//! Outputs (`rootfs.tar`, `metadata.tar`, `config.json`, `sha256`) survive a
//! run; every scratch directory is removed at the end of it.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::rootfs::MergePaths;

pub const BUILD_DIR: &str = "build";
pub const ROOTFS_TAR: &str = "rootfs.tar";
pub const METADATA_TAR: &str = "metadata.tar";
pub const CONFIG_JSON: &str = "config.json";
pub const IDENTITY_FILE: &str = "sha256";

/// Every path a run touches, derived once from the work dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPaths {
    pub output: PathBuf,
    pub raw: PathBuf,
    pub metadata: PathBuf,
    pub mount: PathBuf,
    pub unpack: PathBuf,
    pub rootfs: PathBuf,
}

impl BuildPaths {
    pub fn new(work_dir: &Path) -> Self {
        let output = work_dir.join(BUILD_DIR);
        Self {
            raw: output.join("raw"),
            metadata: output.join("metadata"),
            mount: output.join("mnt"),
            unpack: output.join("unpack"),
            rootfs: output.join("rootfs"),
            output,
        }
    }

    pub fn rootfs_tar(&self) -> PathBuf {
        self.output.join(ROOTFS_TAR)
    }

    pub fn metadata_tar(&self) -> PathBuf {
        self.output.join(METADATA_TAR)
    }

    pub fn config_json(&self) -> PathBuf {
        self.output.join(CONFIG_JSON)
    }

    pub fn identity_file(&self) -> PathBuf {
        self.output.join(IDENTITY_FILE)
    }

    /// Scratch directories, removed at the end of every run.
    pub fn scratch_dirs(&self) -> [&Path; 5] {
        [
            self.metadata.as_path(),
            self.unpack.as_path(),
            self.mount.as_path(),
            self.raw.as_path(),
            self.rootfs.as_path(),
        ]
    }

    /// Paths the rootfs merger needs.
    pub fn merge_paths(&self) -> MergePaths {
        MergePaths {
            unpack: self.unpack.clone(),
            mount: self.mount.clone(),
            rootfs: self.rootfs.clone(),
            archive: self.rootfs_tar(),
        }
    }

    /// Wipe whatever a previous run left behind and create a fresh tree.
    pub fn prepare(&self) -> Result<()> {
        tracing::info!("Cleaning output directory: {}", self.output.display());
        if self.output.exists() {
            fs::remove_dir_all(&self.output)
                .with_context(|| format!("Failed to remove {}", self.output.display()))?;
        }
        for dir in [&self.output, &self.unpack, &self.mount] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Remove every scratch directory. Problems are logged, not returned,
    /// so cleanup never hides the error that ended the run.
    pub fn cleanup_scratch(&self) -> usize {
        let mut failures = 0;
        for dir in self.scratch_dirs() {
            if !dir.exists() {
                continue;
            }
            if let Err(e) = fs::remove_dir_all(dir) {
                tracing::warn!("Failed to remove {}: {}", dir.display(), e);
                failures += 1;
            }
        }
        failures
    }
}
