//! Filesystem layout derived from an [`InstallConfig`].
//!
//! This module only defines WHERE things go, not HOW to get them there.

use std::path::{Path, PathBuf};

use crate::config::{InstallConfig, VERSION_PLACEHOLDER};

/// Upstream tarballs unpack to `openvswitch-<version>/`.
pub const SOURCE_TREE_PREFIX: &str = "openvswitch-";

/// Installed binaries whose `--version` output is checked after install.
pub const VSWITCHD_BINARY: &str = "ovs-vswitchd";

const MANIFEST_FILENAME: &str = ".ovs-installer.json";
const LOCK_FILENAME: &str = ".ovs-installer.lock";

/// Paths used by one install of one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    /// Fixed install root (e.g. `/opt/ovs`)
    pub install_root: PathBuf,
    /// Extracted upstream sources live here
    pub source_dir: PathBuf,
    /// Downloaded tarballs
    pub downloads_dir: PathBuf,
    /// Fully expanded download URL
    pub download_url: String,
    /// Local tarball path
    pub tarball: PathBuf,
    /// `src/openvswitch-<version>`
    pub source_tree: PathBuf,
    /// `make install` prefix
    pub prefix: PathBuf,
    pub sbin_dir: PathBuf,
    /// Kernel object as produced by the build
    pub built_module: PathBuf,
    /// Kernel object after the post-install copy
    pub installed_module: PathBuf,
    pub manifest: PathBuf,
    pub lock_file: PathBuf,
}

impl InstallLayout {
    pub fn new(config: &InstallConfig) -> Self {
        let install_root = config.install_root.clone();
        let source_dir = install_root.join("src");
        let downloads_dir = source_dir.join("downloads");
        let download_url = download_url(&config.mirror_url, &config.version);
        let tarball = downloads_dir.join(tarball_name(&download_url, &config.version));
        let source_tree = source_dir.join(source_tree_name(&config.version));
        let prefix = install_root.join(&config.version);
        let sbin_dir = prefix.join("sbin");
        let built_module = source_tree.join(&config.module_object);
        let installed_module = sbin_dir.join(
            config
                .module_object
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(format!("{}.ko", config.module_name))),
        );

        Self {
            manifest: prefix.join(MANIFEST_FILENAME),
            lock_file: install_root.join(LOCK_FILENAME),
            install_root,
            source_dir,
            downloads_dir,
            download_url,
            tarball,
            source_tree,
            prefix,
            sbin_dir,
            built_module,
            installed_module,
        }
    }

    /// Directories created before anything is fetched.
    pub fn directories(&self) -> [&Path; 2] {
        [&self.install_root, &self.source_dir]
    }

    pub fn vswitchd(&self) -> PathBuf {
        self.sbin_dir.join(VSWITCHD_BINARY)
    }
}

/// Kernel paths for one kernel release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPaths {
    pub release: String,
    /// `/lib/modules/<release>`
    pub modules_dir: PathBuf,
    /// `/lib/modules/<release>/build`, passed to `configure --with-linux`
    pub build_dir: PathBuf,
}

impl KernelPaths {
    pub fn new(modules_root: &Path, release: &str) -> Self {
        let modules_dir = modules_root.join(release);
        Self {
            release: release.to_string(),
            build_dir: modules_dir.join("build"),
            modules_dir,
        }
    }
}

pub fn download_url(template: &str, version: &str) -> String {
    template.replace(VERSION_PLACEHOLDER, version)
}

pub fn source_tree_name(version: &str) -> String {
    format!("{SOURCE_TREE_PREFIX}{version}")
}

/// Last path segment of the URL, ignoring any query or fragment.
pub fn tarball_name(url: &str, version: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
        _ => format!("{}.tar.gz", source_tree_name(version)),
    }
}
