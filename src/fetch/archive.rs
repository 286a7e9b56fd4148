//! Source tarball extraction.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Archive encodings accepted for the upstream tarball.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.tar.gz` / `.tgz`, decompressed by the host `gzip`.
    TarGz,
    /// `.tar.zst`
    TarZst,
    /// Uncompressed `.tar`
    Tar,
}

impl ArchiveFormat {
    pub fn from_path(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Ok(Self::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Ok(Self::TarZst)
        } else if name.ends_with(".tar") {
            Ok(Self::Tar)
        } else {
            bail!(
                "unsupported archive '{}': expected .tar.gz, .tgz, .tar.zst or .tar",
                path.display()
            )
        }
    }
}

/// Unpack `archive` into `dest`.
pub fn unpack(archive: &Path, dest: &Path) -> Result<()> {
    match ArchiveFormat::from_path(archive)? {
        ArchiveFormat::TarGz => unpack_gzip(archive, dest),
        ArchiveFormat::TarZst => {
            let f = File::open(archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            let decoder = zstd::stream::Decoder::new(f)?;
            tar::Archive::new(decoder)
                .unpack(dest)
                .with_context(|| format!("Failed to unpack {}", archive.display()))
        }
        ArchiveFormat::Tar => {
            let f = File::open(archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            tar::Archive::new(f)
                .unpack(dest)
                .with_context(|| format!("Failed to unpack {}", archive.display()))
        }
    }
}

/// Stream `gzip -dc` output straight into the tar reader.
fn unpack_gzip(archive: &Path, dest: &Path) -> Result<()> {
    let mut child = Command::new("gzip")
        .arg("-dc")
        .arg(archive)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("running gzip for '{}'", archive.display()))?;

    let stdout = child
        .stdout
        .take()
        .context("gzip stdout was not captured")?;
    let mut tarball = tar::Archive::new(stdout);
    let unpacked = tarball.unpack(dest);
    // The tar reader stops at the end-of-archive block; gzip still has the
    // record padding to write and must not see a closed pipe.
    let drained = io::copy(&mut tarball.into_inner(), &mut io::sink());

    let output = child
        .wait_with_output()
        .with_context(|| format!("waiting for gzip on '{}'", archive.display()))?;

    unpacked.with_context(|| format!("Failed to unpack {}", archive.display()))?;
    drained.with_context(|| format!("reading gzip output for '{}'", archive.display()))?;

    if !output.status.success() {
        bail!(
            "gzip failed decompressing '{}' (status {}): {}",
            archive.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Extract `archive` and move its `tree_name` directory into `source_dir`.
///
/// Extraction happens in a scratch directory first; a failed extraction
/// leaves nothing under `source_dir`. An existing tree with the same name is
/// replaced.
pub fn extract_source_tree(archive: &Path, source_dir: &Path, tree_name: &str) -> Result<PathBuf> {
    let scratch = source_dir.join(format!(".extract-{tree_name}"));
    if scratch.exists() {
        fs::remove_dir_all(&scratch).with_context(|| {
            format!("removing stale extraction directory '{}'", scratch.display())
        })?;
    }
    fs::create_dir_all(&scratch)
        .with_context(|| format!("creating extraction directory '{}'", scratch.display()))?;

    if let Err(e) = unpack(archive, &scratch) {
        let _ = fs::remove_dir_all(&scratch);
        return Err(e);
    }

    let extracted = scratch.join(tree_name);
    if !extracted.is_dir() {
        let found = top_level_entries(&scratch);
        let _ = fs::remove_dir_all(&scratch);
        bail!(
            "archive '{}' does not contain the expected top-level directory '{}' (found: {})",
            archive.display(),
            tree_name,
            if found.is_empty() {
                "nothing".to_string()
            } else {
                found.join(", ")
            }
        );
    }

    let target = source_dir.join(tree_name);
    if target.exists() {
        log::info!("replacing existing source tree {}", target.display());
        fs::remove_dir_all(&target)
            .with_context(|| format!("removing existing source tree '{}'", target.display()))?;
    }
    fs::rename(&extracted, &target).with_context(|| {
        format!(
            "moving extracted tree '{}' -> '{}'",
            extracted.display(),
            target.display()
        )
    })?;
    fs::remove_dir_all(&scratch)
        .with_context(|| format!("removing extraction directory '{}'", scratch.display()))?;

    Ok(target)
}

fn top_level_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
