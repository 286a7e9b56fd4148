//! Source installer for Open vSwitch.
//!
//! Builds a fixed Open vSwitch release from the upstream tarball against the
//! running kernel and installs it under a version-specific prefix:
//!
//! - **Configuration** - Defaults, `/etc/ovs-installer.toml`, and command-line overrides
//! - **Fetch** - Tarball download with retry and SHA-256 verification
//! - **Build** - `configure`, `make`, `make install`, `make modules_install`
//! - **Kernel module** - `modprobe`, and the post-install copy of the `.ko`
//! - **Pipeline** - Ordered steps that stop at the first failure
//!
//! # Layout
//!
//! ```text
//! /opt/ovs/
//!     ├── .ovs-installer.lock
//!     ├── src/
//!     │   ├── downloads/openvswitch-2.4.0.tar.gz
//!     │   └── openvswitch-2.4.0/
//!     └── 2.4.0/                       (make install prefix)
//!         ├── .ovs-installer.json
//!         └── sbin/
//!             ├── ovs-vswitchd
//!             └── openvswitch.ko
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ovs_installer::{resolve_config, ConfigOverrides, InstallContext, Pipeline};
//!
//! let config = resolve_config(None, ConfigOverrides::default())?;
//! let mut ctx = InstallContext::new(config);
//! Pipeline::standard().run(&mut ctx)?;
//! ```

pub mod build;
pub mod config;
pub mod fetch;
pub mod kmod;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod pipeline;
pub mod preflight;
pub mod process;

pub use config::{resolve_config, ConfigOverrides, InstallConfig};
pub use layout::{InstallLayout, KernelPaths};
pub use manifest::InstallManifest;
pub use pipeline::{InstallContext, InstallReport, Pipeline, PipelineFailure, Step};
