//! Upstream build: `./configure`, `make`, `make install`, `make modules_install`.
//!
//! All output from the upstream build system streams to the terminal. Any
//! non-zero exit is returned as an error naming the step.
//!
//! # Usage
//!
//! ```rust,ignore
//! use ovs_installer::build::{configure, compile, install, install_modules};
//!
//! configure(&layout.source_tree, &layout.prefix, &kernel)?;
//! compile(&layout.source_tree, config.jobs)?;
//! install(&layout.source_tree)?;
//! install_modules(&layout.source_tree)?;
//! ```

use anyhow::{bail, Result};
use std::ffi::OsString;
use std::path::Path;

use crate::layout::KernelPaths;
use crate::process::{ensure_exists, Cmd};

/// Arguments passed to `./configure`.
pub fn configure_args(prefix: &Path, kernel: &KernelPaths) -> Vec<OsString> {
    let mut prefix_arg = OsString::from("--prefix=");
    prefix_arg.push(prefix.as_os_str());
    let mut linux_arg = OsString::from("--with-linux=");
    linux_arg.push(kernel.build_dir.as_os_str());
    vec![prefix_arg, linux_arg]
}

/// Arguments passed to the compile `make`. Plain `make` unless `jobs` is set.
pub fn make_args(jobs: Option<u32>) -> Vec<String> {
    match jobs {
        Some(n) => vec![format!("-j{n}")],
        None => Vec::new(),
    }
}

/// Run `./configure` with the install prefix and the running kernel's headers.
pub fn configure(source_tree: &Path, prefix: &Path, kernel: &KernelPaths) -> Result<()> {
    let script = source_tree.join("configure");
    ensure_exists(&script, "configure script")?;

    if !kernel.build_dir.is_dir() {
        bail!(
            "Kernel build headers for {} not found at {}\n\
             Install the headers package for the running kernel (e.g. linux-headers-{}).",
            kernel.release,
            kernel.build_dir.display(),
            kernel.release
        );
    }

    log::info!(
        "configuring {} (prefix {}, kernel {})",
        source_tree.display(),
        prefix.display(),
        kernel.release
    );
    Cmd::new(script.to_string_lossy().into_owned())
        .args(configure_args(prefix, kernel))
        .dir(source_tree)
        .error_msg("configure failed")
        .run_interactive()?;
    Ok(())
}

pub fn compile(source_tree: &Path, jobs: Option<u32>) -> Result<()> {
    log::info!("compiling {}", source_tree.display());
    Cmd::new("make")
        .args(make_args(jobs))
        .dir(source_tree)
        .error_msg("build failed")
        .run_interactive()?;
    Ok(())
}

/// Install userspace binaries and libraries under the configured prefix.
pub fn install(source_tree: &Path) -> Result<()> {
    log::info!("installing userspace from {}", source_tree.display());
    Cmd::new("make")
        .arg("install")
        .dir(source_tree)
        .error_msg("make install failed")
        .run_interactive()?;
    Ok(())
}

/// Install kernel modules into the running kernel's module tree.
pub fn install_modules(source_tree: &Path) -> Result<()> {
    log::info!("installing kernel modules from {}", source_tree.display());
    Cmd::new("make")
        .arg("modules_install")
        .dir(source_tree)
        .error_msg("make modules_install failed")
        .run_interactive()?;
    Ok(())
}
