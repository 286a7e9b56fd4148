//! Installer configuration.
//!
//! Every value the install depends on lives in [`InstallConfig`]. Values come
//! from the built-in defaults, then an optional TOML file, then command-line
//! overrides, in that order.
//!
//! ```toml
//! version = "2.4.0"
//! mirror_url = "http://openvswitch.org/releases/openvswitch-{version}.tar.gz"
//! install_root = "/opt/ovs"
//! sha256 = "..."
//! jobs = 4
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_VERSION: &str = "2.4.0";
pub const DEFAULT_MIRROR_URL: &str =
    "http://openvswitch.org/releases/openvswitch-{version}.tar.gz";
pub const DEFAULT_INSTALL_ROOT: &str = "/opt/ovs";
pub const DEFAULT_MODULE_NAME: &str = "openvswitch";
pub const DEFAULT_MODULE_OBJECT: &str = "datapath/linux/openvswitch.ko";
pub const DEFAULT_KERNEL_MODULES_ROOT: &str = "/lib/modules";
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;
pub const MAX_FETCH_RETRIES: u32 = 20;
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

/// Config file read when `--config` is not given and the file exists.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/ovs-installer.toml";

/// Placeholder substituted with the version in `mirror_url`.
pub const VERSION_PLACEHOLDER: &str = "{version}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    pub version: String,
    pub mirror_url: String,
    pub install_root: PathBuf,
    pub sha256: Option<String>,
    pub require_checksum: bool,
    pub module_name: String,
    pub module_object: PathBuf,
    pub kernel_modules_root: PathBuf,
    pub kernel_release: Option<String>,
    pub jobs: Option<u32>,
    pub fetch_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION.to_string(),
            mirror_url: DEFAULT_MIRROR_URL.to_string(),
            install_root: PathBuf::from(DEFAULT_INSTALL_ROOT),
            sha256: None,
            require_checksum: false,
            module_name: DEFAULT_MODULE_NAME.to_string(),
            module_object: PathBuf::from(DEFAULT_MODULE_OBJECT),
            kernel_modules_root: PathBuf::from(DEFAULT_KERNEL_MODULES_ROOT),
            kernel_release: None,
            jobs: None,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

/// Partial configuration. Used both for the TOML file and for command-line
/// overrides; `None` leaves the current value alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    pub version: Option<String>,
    pub mirror_url: Option<String>,
    pub install_root: Option<PathBuf>,
    pub sha256: Option<String>,
    pub require_checksum: Option<bool>,
    pub module_name: Option<String>,
    pub module_object: Option<PathBuf>,
    pub kernel_modules_root: Option<PathBuf>,
    pub kernel_release: Option<String>,
    pub jobs: Option<u32>,
    pub fetch_retries: Option<u32>,
    pub retry_delay_secs: Option<u64>,
}

impl InstallConfig {
    /// Layer `overrides` on top of this config.
    pub fn apply(mut self, overrides: ConfigOverrides) -> Self {
        if let Some(v) = overrides.version {
            self.version = v.trim().to_string();
        }
        if let Some(v) = overrides.mirror_url {
            self.mirror_url = v.trim().to_string();
        }
        if let Some(v) = overrides.install_root {
            self.install_root = v;
        }
        if let Some(v) = overrides.sha256 {
            self.sha256 = Some(v.trim().to_ascii_lowercase());
        }
        if let Some(v) = overrides.require_checksum {
            self.require_checksum = v;
        }
        if let Some(v) = overrides.module_name {
            self.module_name = v.trim().to_string();
        }
        if let Some(v) = overrides.module_object {
            self.module_object = v;
        }
        if let Some(v) = overrides.kernel_modules_root {
            self.kernel_modules_root = v;
        }
        if let Some(v) = overrides.kernel_release {
            self.kernel_release = Some(v.trim().to_string());
        }
        if let Some(v) = overrides.jobs {
            self.jobs = Some(v);
        }
        if let Some(v) = overrides.fetch_retries {
            self.fetch_retries = v;
        }
        if let Some(v) = overrides.retry_delay_secs {
            self.retry_delay_secs = v;
        }
        self
    }

    /// Reject values that would produce unsafe or meaningless paths.
    pub fn validate(&self) -> Result<()> {
        validate_version(&self.version)?;

        if !self.mirror_url.contains(VERSION_PLACEHOLDER) {
            bail!(
                "invalid mirror_url '{}': must contain '{}'",
                self.mirror_url,
                VERSION_PLACEHOLDER
            );
        }
        if !["http://", "https://", "file://"]
            .iter()
            .any(|scheme| self.mirror_url.starts_with(scheme))
        {
            bail!(
                "invalid mirror_url '{}': expected an http://, https:// or file:// URL",
                self.mirror_url
            );
        }

        if !self.install_root.is_absolute() {
            bail!(
                "invalid install_root '{}': must be an absolute path",
                self.install_root.display()
            );
        }
        if !self.kernel_modules_root.is_absolute() {
            bail!(
                "invalid kernel_modules_root '{}': must be an absolute path",
                self.kernel_modules_root.display()
            );
        }

        match &self.sha256 {
            Some(sha) if !is_hex_64(sha) => {
                bail!("invalid sha256 '{}': expected 64 hex characters", sha)
            }
            None if self.require_checksum => {
                bail!("require_checksum is set but no sha256 is configured")
            }
            _ => {}
        }

        if self.module_name.is_empty()
            || !self
                .module_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("invalid module_name '{}'", self.module_name);
        }

        validate_relative_path(&self.module_object, "module_object")?;
        if self.module_object.extension().and_then(|e| e.to_str()) != Some("ko") {
            bail!(
                "invalid module_object '{}': expected a .ko file",
                self.module_object.display()
            );
        }

        if let Some(release) = &self.kernel_release {
            if release.is_empty() || release.contains('/') || release.contains("..") {
                bail!("invalid kernel_release '{}'", release);
            }
        }

        if self.jobs == Some(0) {
            bail!("invalid jobs value 0: must be at least 1");
        }

        if self.fetch_retries > MAX_FETCH_RETRIES {
            bail!(
                "invalid fetch_retries {}: at most {} allowed",
                self.fetch_retries,
                MAX_FETCH_RETRIES
            );
        }
        if self.retry_delay_secs > MAX_RETRY_DELAY_SECS {
            bail!(
                "invalid retry_delay_secs {}: at most {} allowed",
                self.retry_delay_secs,
                MAX_RETRY_DELAY_SECS
            );
        }

        Ok(())
    }
}

/// Read a TOML config file into overrides.
pub fn load_config_file(path: &Path) -> Result<ConfigOverrides> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config '{}'", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config '{}'", path.display()))
}

/// Resolve the full configuration.
///
/// `explicit` is the `--config` argument. Without it the system config is
/// read only if present.
pub fn resolve_config(explicit: Option<&Path>, cli: ConfigOverrides) -> Result<InstallConfig> {
    let mut config = InstallConfig::default();

    let file = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let system = PathBuf::from(SYSTEM_CONFIG_PATH);
            system.is_file().then_some(system)
        }
    };
    if let Some(path) = file {
        log::debug!("loading config from {}", path.display());
        config = config.apply(load_config_file(&path)?);
    }

    let config = config.apply(cli);
    config.validate()?;
    Ok(config)
}

fn validate_version(version: &str) -> Result<()> {
    if version.is_empty() {
        bail!("invalid version: must not be empty");
    }
    if version.contains("..") {
        bail!("invalid version '{}': must not contain '..'", version);
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        bail!(
            "invalid version '{}': only letters, digits, '.', '_' and '-' are allowed",
            version
        );
    }
    Ok(())
}

fn validate_relative_path(path: &Path, field: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("{field} must not be empty");
    }
    if path.is_absolute() {
        bail!(
            "{field} must be relative, got absolute path '{}'",
            path.display()
        );
    }
    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        ) {
            bail!(
                "{field} contains invalid traversal/root component in '{}'",
                path.display()
            );
        }
    }
    Ok(())
}

pub(crate) fn is_hex_64(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
