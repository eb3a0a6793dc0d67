//! Host implementations backed by real binaries.

use anyhow::Result;
use std::path::Path;

use super::{BlobDownloader, ImageTransfer, LayerTools, OverlaySpec};
use crate::process::Cmd;

/// skopeo-backed image transfer.
#[derive(Debug, Clone)]
pub struct Skopeo {
    program: String,
}

impl Skopeo {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Skopeo {
    fn default() -> Self {
        Self::new("skopeo")
    }
}

impl ImageTransfer for Skopeo {
    fn copy_to_dir(&self, source: &str, dest_dir: &Path) -> Result<()> {
        let dest = format!("dir:{}", dest_dir.display());
        tracing::info!("Copy image: {} -> {}", source, dest);
        Cmd::new(&self.program)
            .arg("copy")
            .arg(source)
            .arg(&dest)
            .run()?;
        Ok(())
    }

    fn copy_to_archive(
        &self,
        src_dir: &Path,
        archive: &Path,
        additional_tag: Option<&str>,
    ) -> Result<()> {
        let src = format!("dir:{}", src_dir.display());
        let dest = format!("docker-archive:{}", archive.display());
        tracing::info!("Copy image: {} -> {}", src, dest);

        let mut cmd = Cmd::new(&self.program).arg("copy");
        if let Some(tag) = additional_tag {
            cmd = cmd.args(["--additional-tag", tag]);
        }
        cmd.arg(&src).arg(&dest).run()?;
        Ok(())
    }
}

/// curl-backed downloader.
#[derive(Debug, Clone)]
pub struct Curl {
    program: String,
}

impl Curl {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for Curl {
    fn default() -> Self {
        Self::new("curl")
    }
}

impl BlobDownloader for Curl {
    fn download(&self, url: &str, dest: &Path) -> Result<()> {
        tracing::info!("Downloading {} -> {}", url, dest.display());
        // -f: HTTP errors must fail the run, not leave an error page behind
        Cmd::new(&self.program)
            .args(["-f", "-s", "-S", "-L", "-o"])
            .arg_path(dest)
            .arg(url)
            .run()?;
        Ok(())
    }
}

/// tar / mount / umount / cp / mknod / setfattr from the host.
#[derive(Debug, Clone, Default)]
pub struct HostLayerTools;

impl LayerTools for HostLayerTools {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        Cmd::new("tar")
            .arg("-xf")
            .arg_path(archive)
            .arg("-C")
            .arg_path(dest)
            .run()?;
        Ok(())
    }

    fn make_whiteout(&self, path: &Path) -> Result<()> {
        Cmd::new("mknod")
            .arg_path(path)
            .args(["c", "0", "0"])
            .run()?;
        Ok(())
    }

    fn mark_opaque(&self, dir: &Path) -> Result<()> {
        Cmd::new("setfattr")
            .args(["-n", "trusted.overlay.opaque", "-v", "y"])
            .arg_path(dir)
            .run()?;
        Ok(())
    }

    fn mount_overlay(&self, spec: &OverlaySpec) -> Result<()> {
        let lower = spec
            .lower_dirs
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let cmd = Cmd::new("mount")
            .args(["-t", "overlay", "overlay", "-o"])
            .arg(format!("lowerdir={},index=off", lower))
            .arg_path(&spec.target);
        tracing::info!("Mount: {}", cmd);
        cmd.run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount").arg_path(target).run()?;
        Ok(())
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<()> {
        Cmd::new("cp")
            .arg("-rp")
            .arg_path(src)
            .arg_path(dest)
            .run()?;
        Ok(())
    }

    fn archive_dir(&self, parent: &Path, name: &str, archive: &Path) -> Result<()> {
        Cmd::new("tar")
            .arg("-cf")
            .arg_path(archive)
            .arg("-C")
            .arg_path(parent)
            .arg(name)
            .run()?;
        Ok(())
    }
}
