//! Kernel module operations: release lookup, load, unload, object copy.
//!
//! Loading goes through `modprobe` so dependencies (e.g. `libcrc32c`,
//! `nf_conntrack`) are resolved from the module tree `make modules_install`
//! just populated.

use anyhow::{bail, Context, Result};
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::fetch::checksum::sha256_file;
use crate::process::Cmd;

const PROC_MODULES: &str = "/proc/modules";

/// Release of the running kernel (`uname -r`).
pub fn running_kernel_release() -> Result<String> {
    // SAFETY: utsname is plain data; uname fills it in or returns -1.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(std::io::Error::last_os_error()).context("uname failed");
    }
    // SAFETY: the kernel NUL-terminates every utsname field.
    let release = unsafe { CStr::from_ptr(uts.release.as_ptr()) }
        .to_string_lossy()
        .trim()
        .to_string();
    if release.is_empty() {
        bail!("uname returned an empty kernel release");
    }
    Ok(release)
}

/// Whether `name` appears in `/proc/modules` content.
///
/// The kernel lists modules with `_`; `-` in `name` is treated the same way.
pub fn module_listed(proc_modules: &str, name: &str) -> bool {
    let wanted = name.replace('-', "_");
    proc_modules
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .any(|listed| listed == wanted)
}

pub fn is_loaded(name: &str) -> Result<bool> {
    let content = fs::read_to_string(PROC_MODULES)
        .with_context(|| format!("reading {}", PROC_MODULES))?;
    Ok(module_listed(&content, name))
}

/// Load `name` into the running kernel and confirm it is listed.
pub fn load_module(name: &str) -> Result<()> {
    log::info!("loading kernel module {}", name);
    Cmd::new("modprobe")
        .arg(name)
        .error_msg(&format!("modprobe {name} failed"))
        .run()?;

    if !is_loaded(name)? {
        bail!(
            "modprobe {} succeeded but the module is not listed in {}",
            name,
            PROC_MODULES
        );
    }
    Ok(())
}

/// Remove `name` from the running kernel.
pub fn unload_module(name: &str) -> Result<()> {
    log::info!("unloading kernel module {}", name);
    Cmd::new("modprobe")
        .args(["-r", name])
        .error_msg(&format!("modprobe -r {name} failed"))
        .run()?;
    Ok(())
}

/// Find the built kernel object.
///
/// Prefers `source_tree/relative`; otherwise the first `<module_name>.ko`
/// found anywhere in the tree.
pub fn locate_module_object(source_tree: &Path, relative: &Path, module_name: &str) -> Result<PathBuf> {
    let expected = source_tree.join(relative);
    if expected.is_file() {
        return Ok(expected);
    }

    let filename = format!("{module_name}.ko");
    let mut walk_errors = 0;
    for entry in WalkDir::new(source_tree).sort_by_file_name() {
        match entry {
            Ok(e) => {
                if e.file_type().is_file() && e.file_name().to_str() == Some(filename.as_str()) {
                    log::warn!(
                        "{} not found; using {}",
                        expected.display(),
                        e.path().display()
                    );
                    return Ok(e.path().to_path_buf());
                }
            }
            Err(e) => {
                walk_errors += 1;
                log::warn!("error reading source tree entry: {}", e);
            }
        }
    }

    bail!(
        "kernel object {} not found under {} (expected {}; {} unreadable entries)",
        filename,
        source_tree.display(),
        expected.display(),
        walk_errors
    )
}

/// Copy the built kernel object into `dest` and check the copy is identical.
///
/// Returns the sha256 of the copied object.
pub fn copy_module_object(built: &Path, dest: &Path) -> Result<String> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating '{}'", parent.display()))?;
    }
    fs::copy(built, dest)
        .with_context(|| format!("copying '{}' -> '{}'", built.display(), dest.display()))?;

    let (built_sha, _) = sha256_file(built)?;
    let (copied_sha, _) = sha256_file(dest)?;
    if built_sha != copied_sha {
        bail!(
            "copied kernel object differs from build output\n  built:  {} ({})\n  copied: {} ({})",
            built.display(),
            built_sha,
            dest.display(),
            copied_sha
        );
    }
    Ok(copied_sha)
}
