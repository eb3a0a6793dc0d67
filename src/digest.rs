//! Content addressing.
//!
//! SHA-256 over byte streams, hex encoded. Files are hashed as one
//! concatenated stream in the order given, so the same blobs in a different
//! order produce a different address.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

/// Algorithm prefix used by OCI descriptors.
pub const SHA256_PREFIX: &str = "sha256:";

const CHUNK_SIZE: usize = 64 * 1024;

/// Hash an in-memory byte slice.
pub fn hash_bytes(data: impl AsRef<[u8]>) -> String {
    format!("{:x}", Sha256::digest(data.as_ref()))
}

/// Hash multiple files concatenated, streaming each in fixed-size chunks.
///
/// An empty list hashes to the empty string rather than the digest of
/// zero bytes; an image with no layers has no rootfs identity.
pub fn hash_files<P: AsRef<Path>>(paths: &[P]) -> Result<String> {
    if paths.is_empty() {
        return Ok(String::new());
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    for path in paths {
        let path = path.as_ref();
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
        loop {
            let n = match file.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to read {} for hashing", path.display()))
                }
            };
            hasher.update(&buf[..n]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a single file.
pub fn hash_file(path: &Path) -> Result<String> {
    hash_files(&[path])
}

/// `sha256:<hex>` form used in manifests.
pub fn prefixed(hex: &str) -> String {
    format!("{}{}", SHA256_PREFIX, hex)
}

/// Strip the `sha256:` prefix, leaving other strings untouched.
pub fn strip_prefix(digest: &str) -> &str {
    digest.strip_prefix(SHA256_PREFIX).unwrap_or(digest)
}

/// A blob stored under its own content address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Hex digest, also the file name.
    pub hex: String,
    /// Size in bytes.
    pub size: u64,
}

/// Store `data` in `dir` under its content address.
///
/// The bytes are written to `temp_name` first, hashed from disk, then renamed
/// to the hash, so the final name always matches the stored content.
pub fn store_content_addressed(dir: &Path, temp_name: &str, data: &[u8]) -> Result<StoredBlob> {
    let temp = dir.join(temp_name);
    fs::write(&temp, data).with_context(|| format!("Failed to write {}", temp.display()))?;

    let hex = hash_file(&temp)?;
    let target = dir.join(&hex);
    fs::rename(&temp, &target).with_context(|| {
        format!("Failed to move {} to {}", temp.display(), target.display())
    })?;

    let size = fs::metadata(&target)
        .with_context(|| format!("Failed to stat {}", target.display()))?
        .len();

    Ok(StoredBlob { hex, size })
}
