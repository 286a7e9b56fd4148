//! Install manifest written under the prefix after a successful install.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallManifest {
    pub version: String,
    pub kernel_release: String,
    pub prefix: PathBuf,
    pub download_url: String,
    pub tarball_sha256: String,
    pub module_name: String,
    pub module_path: PathBuf,
    pub module_sha256: String,
    /// The module was already loaded before this install, so the running
    /// copy may not be the one recorded here.
    #[serde(default)]
    pub module_preloaded: bool,
    /// Step ids in execution order.
    pub steps: Vec<String>,
    pub installed_at_utc: String,
}

impl InstallManifest {
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating manifest directory '{}'", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self).context("serializing install manifest")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("writing install manifest '{}'", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| {
            format!("moving '{}' -> '{}'", tmp.display(), path.display())
        })?;
        Ok(())
    }

    /// `Ok(None)` when no manifest exists at `path`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(path)
            .with_context(|| format!("reading install manifest '{}'", path.display()))?;
        let parsed = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing install manifest '{}'", path.display()))?;
        Ok(Some(parsed))
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn now_utc_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
