//! Shared test utilities: synthetic images and in-process tool fakes.

#![allow(dead_code)]

use anyhow::{bail, Context, Result};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

use extimg::digest;
use extimg::tools::{BlobDownloader, ImageTransfer, LayerTools, OverlaySpec, Toolchain};

// =============================================================================
// Synthetic images
// =============================================================================

/// One entry of a synthetic layer.
pub enum Entry<'a> {
    File(&'a str, &'a str),
    Dir(&'a str),
    Symlink(&'a str, &'a str),
    /// OCI whiteout for the given path.
    Whiteout(&'a str),
    /// Opaque marker for the given directory.
    Opaque(&'a str),
}

/// Build an uncompressed layer tarball in memory.
pub fn layer_tar(entries: &[Entry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        match entry {
            Entry::File(path, content) => append_file(&mut builder, path, content.as_bytes()),
            Entry::Dir(path) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_cksum();
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            }
            Entry::Symlink(path, target) => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, path, target).unwrap();
            }
            Entry::Whiteout(path) => {
                let p = Path::new(path);
                let name = format!(".wh.{}", p.file_name().unwrap().to_string_lossy());
                let marker = p.parent().map(|d| d.join(&name)).unwrap_or_else(|| PathBuf::from(&name));
                append_file(&mut builder, &marker.to_string_lossy(), b"");
            }
            Entry::Opaque(dir) => {
                let marker = Path::new(dir).join(".wh..wh..opq");
                append_file(&mut builder, &marker.to_string_lossy(), b"");
            }
        }
    }
    builder.into_inner().unwrap()
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, path: &str, content: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, content).unwrap();
}

/// A Directory Transport layout written to disk.
pub struct SyntheticImage {
    pub dir: PathBuf,
    /// Layer blob paths, base first.
    pub layer_blobs: Vec<PathBuf>,
}

impl SyntheticImage {
    /// Write `manifest.json`, the config blob and every layer blob into `dir`.
    pub fn write(dir: &Path, layers: &[Vec<u8>]) -> Self {
        fs::create_dir_all(dir).unwrap();

        let mut descriptors = Vec::new();
        let mut diff_ids = Vec::new();
        let mut layer_blobs = Vec::new();
        for layer in layers {
            let hex = digest::hash_bytes(layer);
            let path = dir.join(&hex);
            fs::write(&path, layer).unwrap();
            descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
                "size": layer.len(),
                "digest": digest::prefixed(&hex),
            }));
            diff_ids.push(digest::prefixed(&hex));
            layer_blobs.push(path);
        }

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": {"Cmd": ["/bin/sh"]},
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        }))
        .unwrap();
        let config_hex = digest::hash_bytes(&config);
        fs::write(dir.join(&config_hex), &config).unwrap();

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": config.len(),
                "digest": digest::prefixed(&config_hex),
            },
            "layers": descriptors,
        });
        fs::write(
            dir.join("manifest.json"),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();
        fs::write(dir.join("version"), "Directory Transport Version: 1.1").unwrap();

        Self {
            dir: dir.to_path_buf(),
            layer_blobs,
        }
    }
}

// =============================================================================
// Tool fakes
// =============================================================================

/// Serves prepared layouts by transport reference and archives with the
/// `tar` crate.
#[derive(Default)]
pub struct FakeTransfer {
    pub images: HashMap<String, PathBuf>,
    pub tags: RefCell<Vec<String>>,
}

impl FakeTransfer {
    pub fn with_image(reference: &str, layout: &Path) -> Self {
        let mut images = HashMap::new();
        images.insert(reference.to_string(), layout.to_path_buf());
        Self {
            images,
            tags: RefCell::new(Vec::new()),
        }
    }
}

impl ImageTransfer for FakeTransfer {
    fn copy_to_dir(&self, source: &str, dest_dir: &Path) -> Result<()> {
        let Some(layout) = self.images.get(source) else {
            bail!("skopeo: reference {} not found", source);
        };
        fs::create_dir_all(dest_dir)?;
        for entry in fs::read_dir(layout)? {
            let entry = entry?;
            fs::copy(entry.path(), dest_dir.join(entry.file_name()))?;
        }
        Ok(())
    }

    fn copy_to_archive(
        &self,
        src_dir: &Path,
        archive: &Path,
        additional_tag: Option<&str>,
    ) -> Result<()> {
        if let Some(tag) = additional_tag {
            self.tags.borrow_mut().push(tag.to_string());
        }
        let mut builder = tar::Builder::new(File::create(archive)?);
        builder.append_dir_all(".", src_dir)?;
        builder.finish()?;
        Ok(())
    }
}

/// Writes fixed bytes for every download.
pub struct StaticDownloader;

impl BlobDownloader for StaticDownloader {
    fn download(&self, _url: &str, dest: &Path) -> Result<()> {
        fs::write(dest, b"auxiliary layer")?;
        Ok(())
    }
}

/// Emulates a read-only overlay by materializing the merged view into the
/// mount point. Keeps a mount table so tests can check for leaks.
#[derive(Default)]
pub struct FakeLayerTools {
    whiteouts: RefCell<BTreeSet<PathBuf>>,
    opaque: RefCell<BTreeSet<PathBuf>>,
    pub mounted: RefCell<Vec<PathBuf>>,
    pub mount_count: Cell<usize>,
    pub fail_copy: Cell<bool>,
    pub fail_archive: Cell<bool>,
}

impl FakeLayerTools {
    fn apply_layer(&self, layer: &Path, target: &Path) -> Result<()> {
        for dir in self.opaque.borrow().iter() {
            if let Ok(rel) = dir.strip_prefix(layer) {
                let hidden = target.join(rel);
                if hidden.is_dir() {
                    fs::remove_dir_all(&hidden)?;
                }
            }
        }
        for whiteout in self.whiteouts.borrow().iter() {
            if let Ok(rel) = whiteout.strip_prefix(layer) {
                remove_any(&target.join(rel))?;
            }
        }
        copy_contents(layer, target, |path| self.whiteouts.borrow().contains(path))
    }
}

impl LayerTools for FakeLayerTools {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let mut archive = tar::Archive::new(File::open(archive)?);
        archive.unpack(dest)?;
        Ok(())
    }

    fn make_whiteout(&self, path: &Path) -> Result<()> {
        self.whiteouts.borrow_mut().insert(path.to_path_buf());
        Ok(())
    }

    fn mark_opaque(&self, dir: &Path) -> Result<()> {
        self.opaque.borrow_mut().insert(dir.to_path_buf());
        Ok(())
    }

    fn mount_overlay(&self, spec: &OverlaySpec) -> Result<()> {
        if spec.lower_dirs.len() < 2 {
            bail!("mount: overlay needs at least two lower dirs");
        }
        if self.mounted.borrow().contains(&spec.target) {
            bail!("mount: {} already mounted", spec.target.display());
        }
        // overlayfs lists the top layer first
        for layer in spec.lower_dirs.iter().rev() {
            self.apply_layer(layer, &spec.target)?;
        }
        self.mounted.borrow_mut().push(spec.target.clone());
        self.mount_count.set(self.mount_count.get() + 1);
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let mut mounted = self.mounted.borrow_mut();
        let Some(pos) = mounted.iter().position(|m| m == target) else {
            bail!("umount: {}: not mounted", target.display());
        };
        mounted.remove(pos);
        fs::remove_dir_all(target)?;
        fs::create_dir_all(target)?;
        Ok(())
    }

    fn copy_tree(&self, src: &Path, dest: &Path) -> Result<()> {
        if self.fail_copy.get() {
            bail!("cp: error writing: No space left on device");
        }
        fs::create_dir_all(dest)?;
        copy_contents(src, dest, |_| false)
    }

    fn archive_dir(&self, parent: &Path, name: &str, archive: &Path) -> Result<()> {
        if self.fail_archive.get() {
            bail!("tar: write error");
        }
        let mut builder = tar::Builder::new(File::create(archive)?);
        builder.follow_symlinks(false);
        builder.append_dir_all(name, parent.join(name))?;
        builder.finish()?;
        Ok(())
    }
}

fn remove_any(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

/// Copy the contents of `src` into `dest`, replacing conflicting entries and
/// recreating symlinks as symlinks.
fn copy_contents(src: &Path, dest: &Path, skip: impl Fn(&Path) -> bool) -> Result<()> {
    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry?;
        if skip(entry.path()) {
            continue;
        }
        let rel = entry.path().strip_prefix(src)?;
        let out = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            if out.symlink_metadata().map(|m| !m.is_dir()).unwrap_or(false) {
                remove_any(&out)?;
            }
            fs::create_dir_all(&out)?;
        } else if file_type.is_symlink() {
            remove_any(&out)?;
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(target, &out)?;
        } else {
            remove_any(&out)?;
            fs::copy(entry.path(), &out)
                .with_context(|| format!("copy {}", entry.path().display()))?;
        }
    }
    Ok(())
}

// =============================================================================
// Test environment
// =============================================================================

/// Temporary work dir plus the fakes a pipeline run needs.
pub struct TestEnv {
    /// Kept alive for the lifetime of the env
    pub _temp_dir: TempDir,
    pub work_dir: PathBuf,
    pub image: SyntheticImage,
    pub transfer: FakeTransfer,
    pub downloader: StaticDownloader,
    pub layers: FakeLayerTools,
}

pub const SOURCE_PREFIX: &str = "docker-daemon:";

impl TestEnv {
    /// Serve an image made of `layers` as `docker-daemon:<reference>`.
    pub fn new(reference: &str, layers: &[Vec<u8>]) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let image = SyntheticImage::write(&temp_dir.path().join("layout"), layers);
        let work_dir = temp_dir.path().join("work");
        fs::create_dir_all(&work_dir).unwrap();

        Self {
            transfer: FakeTransfer::with_image(&format!("{}{}", SOURCE_PREFIX, reference), &image.dir),
            _temp_dir: temp_dir,
            work_dir,
            image,
            downloader: StaticDownloader,
            layers: FakeLayerTools::default(),
        }
    }

    pub fn toolchain(&self) -> Toolchain<'_> {
        Toolchain {
            transfer: &self.transfer,
            downloader: &self.downloader,
            layers: &self.layers,
        }
    }
}

/// Unpack a tar file into a fresh directory.
pub fn unpack_tar(archive: &Path, dest: &Path) {
    fs::create_dir_all(dest).unwrap();
    tar::Archive::new(File::open(archive).unwrap())
        .unpack(dest)
        .unwrap();
}
