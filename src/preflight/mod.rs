//! Preflight checks run before anything touches the host.
//!
//! Validates privileges and that the host has the tools the install drives.
//! This prevents cryptic errors halfway through a build.
//!
//! # Example
//!
//! ```rust
//! use ovs_installer::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("modprobe") {
//!     println!("kmod not installed");
//! }
//!
//! let tools = &[("make", "make"), ("gzip", "gzip")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools needed for a source install.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("curl", "curl"),
    ("gzip", "gzip"),
    ("make", "make"),
    ("cc", "gcc"),
    ("modprobe", "kmod"),
];

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check all tools in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}

/// Effective user id of this process.
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Fail unless `euid` is the superuser.
pub fn check_privileges(euid: u32) -> Result<()> {
    if euid != 0 {
        bail!(
            "ovs-installer must be run as root (effective uid is {})",
            euid
        );
    }
    Ok(())
}
