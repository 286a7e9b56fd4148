//! State threaded through the install steps.

use crate::config::InstallConfig;
use crate::fetch::{CurlTransport, Transport};
use crate::layout::{InstallLayout, KernelPaths};
use crate::lock::InstallLock;
use anyhow::{anyhow, Result};

/// Everything a step may read or record.
///
/// Fields filled in by earlier steps are `Option`s; a later step that needs
/// one fails with a clear error instead of guessing.
pub struct InstallContext {
    pub config: InstallConfig,
    pub layout: InstallLayout,
    pub transport: Box<dyn Transport>,
    /// Effective uid checked by the privilege step.
    pub euid: u32,
    /// Set by preflight.
    pub kernel: Option<KernelPaths>,
    /// Held from directory preparation until the context is dropped.
    pub lock: Option<InstallLock>,
    pub tarball_sha256: Option<String>,
    /// Whether the module was already loaded before this run loaded it.
    pub module_preloaded: Option<bool>,
    pub module_sha256: Option<String>,
    /// Ids of steps that completed, in order.
    pub completed: Vec<&'static str>,
}

impl InstallContext {
    pub fn new(config: InstallConfig) -> Self {
        Self::with_transport(config, Box::new(CurlTransport))
    }

    pub fn with_transport(config: InstallConfig, transport: Box<dyn Transport>) -> Self {
        let layout = InstallLayout::new(&config);
        Self {
            config,
            layout,
            transport,
            euid: crate::preflight::effective_uid(),
            kernel: None,
            lock: None,
            tarball_sha256: None,
            module_preloaded: None,
            module_sha256: None,
            completed: Vec::new(),
        }
    }

    pub fn kernel(&self) -> Result<&KernelPaths> {
        self.kernel
            .as_ref()
            .ok_or_else(|| anyhow!("kernel release has not been resolved (preflight did not run)"))
    }
}
