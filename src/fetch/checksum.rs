//! SHA-256 helpers for downloaded tarballs and copied kernel objects.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::config::is_hex_64;

/// Hash a file, returning (lowercase hex digest, size in bytes).
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = r
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    let sha = format!("{:x}", hasher.finalize());
    Ok((sha, size))
}

/// `<file>.sha256`, recorded next to a tarball downloaded without a
/// configured digest.
pub fn sidecar_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(".sha256");
    PathBuf::from(name)
}

/// Read a recorded digest. `Ok(None)` when the sidecar is missing.
pub fn read_sidecar(file: &Path) -> Result<Option<String>> {
    let path = sidecar_path(file);
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("reading checksum sidecar '{}'", path.display()))?;
    // sha256sum format: "<digest>  <name>"
    let digest = raw
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    if !is_hex_64(&digest) {
        bail!(
            "checksum sidecar '{}' does not contain a sha256 digest",
            path.display()
        );
    }
    Ok(Some(digest))
}

/// Record `digest` for `file` in sha256sum format.
pub fn write_sidecar(file: &Path, digest: &str) -> Result<()> {
    let path = sidecar_path(file);
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    fs::write(&path, format!("{digest}  {name}\n"))
        .with_context(|| format!("writing checksum sidecar '{}'", path.display()))
}
