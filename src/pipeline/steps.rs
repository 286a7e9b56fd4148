//! The install steps, in pipeline order.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::{InstallContext, Step};
use crate::config::InstallConfig;
use crate::fetch::{archive, Fetcher};
use crate::layout::{source_tree_name, KernelPaths};
use crate::lock::InstallLock;
use crate::manifest::{now_utc_rfc3339, InstallManifest};
use crate::process::{ensure_exists, Cmd};
use crate::{build, kmod, preflight};

pub struct PrivilegeCheck;

impl Step for PrivilegeCheck {
    fn id(&self) -> &'static str {
        "privileges"
    }

    fn description(&self) -> &'static str {
        "require root"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        preflight::check_privileges(ctx.euid)
    }
}

pub struct Preflight;

impl Step for Preflight {
    fn id(&self) -> &'static str {
        "preflight"
    }

    fn description(&self) -> &'static str {
        "check host tools and resolve the target kernel"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        preflight::check_host_tools()?;
        let kernel = resolve_kernel(&ctx.config)?;
        log::info!(
            "target kernel {} (headers {})",
            kernel.release,
            kernel.build_dir.display()
        );
        if let Ok(running) = kmod::running_kernel_release() {
            if running != kernel.release {
                log::warn!(
                    "building for kernel {} but {} is running; load-module will refuse to load it",
                    kernel.release,
                    running
                );
            }
        }
        ctx.kernel = Some(kernel);
        Ok(())
    }
}

/// Kernel paths for the configured release, or the running kernel's.
pub fn resolve_kernel(config: &InstallConfig) -> Result<KernelPaths> {
    let release = match &config.kernel_release {
        Some(r) => r.clone(),
        None => kmod::running_kernel_release()?,
    };
    Ok(KernelPaths::new(&config.kernel_modules_root, &release))
}

pub struct PrepareDirectories;

impl Step for PrepareDirectories {
    fn id(&self) -> &'static str {
        "directories"
    }

    fn description(&self) -> &'static str {
        "create the install root and source directory, take the install lock"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        for dir in ctx.layout.directories() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating directory '{}'", dir.display()))?;
        }
        if ctx.lock.is_none() {
            ctx.lock = Some(InstallLock::acquire(&ctx.layout.lock_file)?);
        }
        Ok(())
    }
}

pub struct Fetch;

impl Step for Fetch {
    fn id(&self) -> &'static str {
        "fetch"
    }

    fn description(&self) -> &'static str {
        "download and verify the release tarball"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let outcome = Fetcher::new(
            ctx.transport.as_ref(),
            ctx.config.fetch_retries,
            Duration::from_secs(ctx.config.retry_delay_secs),
        )
        .fetch(
            &ctx.layout.download_url,
            &ctx.layout.tarball,
            ctx.config.sha256.as_deref(),
        )?;
        ctx.tarball_sha256 = Some(outcome.sha256);
        Ok(())
    }
}

pub struct Extract;

impl Step for Extract {
    fn id(&self) -> &'static str {
        "extract"
    }

    fn description(&self) -> &'static str {
        "unpack the source tree"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let tree = archive::extract_source_tree(
            &ctx.layout.tarball,
            &ctx.layout.source_dir,
            &source_tree_name(&ctx.config.version),
        )?;
        log::info!("source tree ready at {}", tree.display());
        Ok(())
    }
}

pub struct Configure;

impl Step for Configure {
    fn id(&self) -> &'static str {
        "configure"
    }

    fn description(&self) -> &'static str {
        "run ./configure against the target kernel headers"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        build::configure(&ctx.layout.source_tree, &ctx.layout.prefix, ctx.kernel()?)
    }
}

pub struct Compile;

impl Step for Compile {
    fn id(&self) -> &'static str {
        "compile"
    }

    fn description(&self) -> &'static str {
        "make"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        build::compile(&ctx.layout.source_tree, ctx.config.jobs)
    }
}

pub struct Install;

impl Step for Install {
    fn id(&self) -> &'static str {
        "install"
    }

    fn description(&self) -> &'static str {
        "make install"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        build::install(&ctx.layout.source_tree)
    }
}

pub struct InstallModules;

impl Step for InstallModules {
    fn id(&self) -> &'static str {
        "modules-install"
    }

    fn description(&self) -> &'static str {
        "make modules_install"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        build::install_modules(&ctx.layout.source_tree)
    }
}

/// Loads the module. Rollback unloads it, but only if this run loaded it.
pub struct LoadModule;

impl Step for LoadModule {
    fn id(&self) -> &'static str {
        "load-module"
    }

    fn description(&self) -> &'static str {
        "modprobe the datapath module"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let running = kmod::running_kernel_release()?;
        ensure_built_for_running_kernel(&ctx.kernel()?.release, &running)?;

        let name = &ctx.config.module_name;
        let preloaded = kmod::is_loaded(name)?;
        if preloaded {
            log::warn!(
                "module {} is already loaded; the running copy may predate this build",
                name
            );
        } else {
            kmod::load_module(name)?;
        }
        ctx.module_preloaded = Some(preloaded);
        Ok(())
    }

    fn reversible(&self) -> bool {
        true
    }

    fn rollback(&self, ctx: &mut InstallContext) -> Result<()> {
        match ctx.module_preloaded {
            Some(false) => kmod::unload_module(&ctx.config.module_name),
            _ => Ok(()),
        }
    }
}

/// `modprobe` only ever targets the running kernel.
pub fn ensure_built_for_running_kernel(target: &str, running: &str) -> Result<()> {
    if target != running {
        bail!(
            "module was built for kernel {} but the running kernel is {}; \
             boot {} and rerun, or drop the kernel_release override",
            target,
            running,
            target
        );
    }
    Ok(())
}

pub struct CopyModule;

impl Step for CopyModule {
    fn id(&self) -> &'static str {
        "copy-module"
    }

    fn description(&self) -> &'static str {
        "copy the kernel object into the prefix sbin directory"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let built = kmod::locate_module_object(
            &ctx.layout.source_tree,
            &ctx.config.module_object,
            &ctx.config.module_name,
        )?;
        let sha = kmod::copy_module_object(&built, &ctx.layout.installed_module)?;
        log::info!(
            "copied {} -> {}",
            built.display(),
            ctx.layout.installed_module.display()
        );
        ctx.module_sha256 = Some(sha);
        Ok(())
    }
}

pub struct Verify;

impl Step for Verify {
    fn id(&self) -> &'static str {
        "verify"
    }

    fn description(&self) -> &'static str {
        "check the module is loaded and ovs-vswitchd reports the installed version"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        ensure_exists(&ctx.layout.installed_module, "installed kernel object")?;
        if !kmod::is_loaded(&ctx.config.module_name)? {
            bail!("module {} is no longer loaded", ctx.config.module_name);
        }
        check_vswitchd_version(&ctx.layout.vswitchd(), &ctx.config.version)
    }
}

/// Run `<binary> --version` and require `version` in its output.
pub fn check_vswitchd_version(binary: &Path, version: &str) -> Result<()> {
    ensure_exists(binary, "ovs-vswitchd")?;
    let result = Cmd::new(binary.to_string_lossy().into_owned())
        .arg("--version")
        .error_msg("ovs-vswitchd --version failed")
        .run()?;

    let reported = result.stdout.lines().next().unwrap_or("").trim().to_string();
    if !reported.split_whitespace().any(|token| token == version) {
        bail!(
            "{} reports '{}', expected version {}",
            binary.display(),
            reported,
            version
        );
    }
    log::info!("{}", reported);
    Ok(())
}

pub struct WriteManifest;

impl Step for WriteManifest {
    fn id(&self) -> &'static str {
        "manifest"
    }

    fn description(&self) -> &'static str {
        "record the install manifest"
    }

    fn run(&self, ctx: &mut InstallContext) -> Result<()> {
        let (Some(tarball_sha256), Some(module_sha256)) =
            (ctx.tarball_sha256.clone(), ctx.module_sha256.clone())
        else {
            bail!("cannot write manifest before the fetch and copy-module steps complete");
        };

        let mut steps: Vec<String> = ctx.completed.iter().map(|s| s.to_string()).collect();
        steps.push(self.id().to_string());

        let manifest = InstallManifest {
            version: ctx.config.version.clone(),
            kernel_release: ctx.kernel()?.release.clone(),
            prefix: ctx.layout.prefix.clone(),
            download_url: ctx.layout.download_url.clone(),
            tarball_sha256,
            module_name: ctx.config.module_name.clone(),
            module_path: ctx.layout.installed_module.clone(),
            module_sha256,
            module_preloaded: ctx.module_preloaded.unwrap_or(false),
            steps,
            installed_at_utc: now_utc_rfc3339(),
        };
        manifest.write(&ctx.layout.manifest)?;
        log::debug!("wrote {}", ctx.layout.manifest.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigOverrides;
    use crate::fetch::{checksum, Transport};
    use crate::pipeline::Pipeline;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct ServeBytes(Vec<u8>);

    impl Transport for ServeBytes {
        fn download(&self, _url: &str, dest: &Path) -> Result<()> {
            fs::write(dest, &self.0)?;
            Ok(())
        }
    }

    struct Unreachable;

    impl Transport for Unreachable {
        fn download(&self, url: &str, _dest: &Path) -> Result<()> {
            bail!("could not resolve host for {url}")
        }
    }

    fn config_in(temp: &TempDir) -> InstallConfig {
        InstallConfig::default().apply(ConfigOverrides {
            install_root: Some(temp.path().join("opt/ovs")),
            mirror_url: Some("file:///mirror/openvswitch-{version}.tar".into()),
            kernel_modules_root: Some(temp.path().join("lib/modules")),
            kernel_release: Some("6.1.0-test".into()),
            fetch_retries: Some(0),
            retry_delay_secs: Some(0),
            ..Default::default()
        })
    }

    fn ctx_with(temp: &TempDir, transport: Box<dyn Transport>) -> InstallContext {
        let mut ctx = InstallContext::with_transport(config_in(temp), transport);
        ctx.euid = 0;
        ctx
    }

    fn source_tarball() -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let body = &b"#!/bin/sh\nexit 0\n"[..];
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "openvswitch-2.4.0/configure", body)
            .unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn privilege_check_accepts_root_only() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        assert!(PrivilegeCheck.run(&mut ctx).is_ok());

        ctx.euid = 1000;
        let err = PrivilegeCheck.run(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("effective uid is 1000"));
    }

    #[test]
    fn kernel_release_override_wins() {
        let temp = TempDir::new().unwrap();
        let kernel = resolve_kernel(&config_in(&temp)).unwrap();
        assert_eq!(kernel.release, "6.1.0-test");
        assert_eq!(
            kernel.build_dir,
            temp.path().join("lib/modules/6.1.0-test/build")
        );
    }

    #[test]
    fn directories_are_idempotent() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("opt/ovs");

        {
            let mut ctx = ctx_with(&temp, Box::new(Unreachable));
            PrepareDirectories.run(&mut ctx).unwrap();
            PrepareDirectories.run(&mut ctx).unwrap();
            assert!(ctx.lock.is_some());
        }
        fs::write(root.join("src/keep.txt"), "x").unwrap();

        let mut again = ctx_with(&temp, Box::new(Unreachable));
        PrepareDirectories.run(&mut again).unwrap();

        assert!(root.is_dir());
        assert!(root.join("src").is_dir());
        assert!(root.join("src/keep.txt").is_file());
    }

    #[test]
    fn concurrent_install_is_refused() {
        let temp = TempDir::new().unwrap();
        let mut first = ctx_with(&temp, Box::new(Unreachable));
        PrepareDirectories.run(&mut first).unwrap();

        let mut second = ctx_with(&temp, Box::new(Unreachable));
        let err = PrepareDirectories.run(&mut second).unwrap_err();
        assert!(err.to_string().contains("holds the install lock"));
    }

    #[test]
    fn fetch_and_extract_produce_source_tree() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(ServeBytes(source_tarball())));

        PrepareDirectories.run(&mut ctx).unwrap();
        Fetch.run(&mut ctx).unwrap();
        Extract.run(&mut ctx).unwrap();

        let (sha, _) = checksum::sha256_file(&ctx.layout.tarball).unwrap();
        assert_eq!(ctx.tarball_sha256.as_deref(), Some(sha.as_str()));
        assert_eq!(
            checksum::read_sidecar(&ctx.layout.tarball).unwrap(),
            Some(sha)
        );
        assert!(ctx.layout.source_tree.join("configure").is_file());
    }

    #[test]
    fn fetch_rejects_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        let config = config_in(&temp).apply(ConfigOverrides {
            sha256: Some("0".repeat(64)),
            ..Default::default()
        });
        let mut ctx =
            InstallContext::with_transport(config, Box::new(ServeBytes(source_tarball())));

        PrepareDirectories.run(&mut ctx).unwrap();
        assert!(Fetch.run(&mut ctx).is_err());
        assert!(!ctx.layout.tarball.exists());
        assert_eq!(ctx.tarball_sha256, None);
    }

    #[test]
    fn fetch_failure_stops_before_build() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        let pipeline = Pipeline::new(vec![
            Box::new(PrepareDirectories),
            Box::new(Fetch),
            Box::new(Extract),
            Box::new(Configure),
        ]);

        let failure = pipeline.run(&mut ctx).unwrap_err();

        assert_eq!(failure.step, "fetch");
        assert_eq!(failure.completed, vec!["directories"]);
        assert!(format!("{:#}", failure.error).contains("failed after 1 attempt"));
        assert!(!ctx.layout.source_tree.exists());
    }

    #[test]
    fn configure_needs_resolved_kernel() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        let err = Configure.run(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("kernel release has not been resolved"));
    }

    #[test]
    fn copy_module_places_identical_object_in_sbin() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        let built = ctx.layout.built_module.clone();
        fs::create_dir_all(built.parent().unwrap()).unwrap();
        fs::write(&built, b"\x7fELF fake module").unwrap();

        CopyModule.run(&mut ctx).unwrap();

        let installed = ctx.layout.sbin_dir.join("openvswitch.ko");
        assert_eq!(ctx.layout.installed_module, installed);
        assert_eq!(fs::read(&installed).unwrap(), fs::read(&built).unwrap());
        let (sha, _) = checksum::sha256_file(&built).unwrap();
        assert_eq!(ctx.module_sha256, Some(sha));
    }

    #[test]
    fn copy_module_fails_without_build_output() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        fs::create_dir_all(&ctx.layout.source_tree).unwrap();

        let err = CopyModule.run(&mut ctx).unwrap_err();
        assert!(err.to_string().contains("openvswitch.ko not found"));
        assert!(!ctx.layout.installed_module.exists());
    }

    #[test]
    fn running_kernel_must_match_build_target() {
        ensure_built_for_running_kernel("6.1.0-18-amd64", "6.1.0-18-amd64").unwrap();

        let err = ensure_built_for_running_kernel("6.1.0-test", "6.5.0-1-amd64")
            .unwrap_err()
            .to_string();
        assert!(err.contains("built for kernel 6.1.0-test"));
        assert!(err.contains("running kernel is 6.5.0-1-amd64"));
    }

    #[test]
    fn load_module_refuses_other_kernel() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        ctx.kernel = Some(resolve_kernel(&ctx.config).unwrap());

        let err = LoadModule.run(&mut ctx).unwrap_err();

        assert!(err.to_string().contains("built for kernel 6.1.0-test"));
        assert_eq!(ctx.module_preloaded, None);
    }

    #[test]
    fn load_module_rollback_keeps_preloaded_module() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        ctx.module_preloaded = Some(true);
        assert!(LoadModule.rollback(&mut ctx).is_ok());

        ctx.module_preloaded = None;
        assert!(LoadModule.rollback(&mut ctx).is_ok());
    }

    fn write_script(path: &Path, body: &str) -> PathBuf {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_path_buf()
    }

    #[test]
    fn vswitchd_version_must_match() {
        let temp = TempDir::new().unwrap();
        let binary = write_script(
            &temp.path().join("sbin/ovs-vswitchd"),
            "echo 'ovs-vswitchd (Open vSwitch) 2.4.0'",
        );

        check_vswitchd_version(&binary, "2.4.0").unwrap();
        let err = check_vswitchd_version(&binary, "2.5.1").unwrap_err();
        assert!(err.to_string().contains("expected version 2.5.1"));
    }

    #[test]
    fn vswitchd_version_matches_whole_token() {
        let temp = TempDir::new().unwrap();
        let longer = write_script(
            &temp.path().join("a/ovs-vswitchd"),
            "echo 'ovs-vswitchd (Open vSwitch) 2.4.01'",
        );
        let prefixed = write_script(
            &temp.path().join("b/ovs-vswitchd"),
            "echo 'ovs-vswitchd (Open vSwitch) 12.4.0'",
        );

        assert!(check_vswitchd_version(&longer, "2.4.0").is_err());
        assert!(check_vswitchd_version(&prefixed, "2.4.0").is_err());
    }

    #[test]
    fn vswitchd_missing_is_error() {
        let temp = TempDir::new().unwrap();
        let err =
            check_vswitchd_version(&temp.path().join("sbin/ovs-vswitchd"), "2.4.0").unwrap_err();
        assert!(err.to_string().contains("ovs-vswitchd not found"));
    }

    #[test]
    fn manifest_records_completed_steps() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        ctx.kernel = Some(resolve_kernel(&ctx.config).unwrap());
        ctx.tarball_sha256 = Some("a".repeat(64));
        ctx.module_sha256 = Some("b".repeat(64));
        ctx.module_preloaded = Some(true);
        ctx.completed = vec!["privileges", "preflight", "verify"];

        WriteManifest.run(&mut ctx).unwrap();

        let manifest = InstallManifest::load(&ctx.layout.manifest).unwrap().unwrap();
        assert_eq!(manifest.version, "2.4.0");
        assert_eq!(manifest.kernel_release, "6.1.0-test");
        assert_eq!(manifest.module_path, ctx.layout.installed_module);
        assert!(manifest.module_preloaded);
        assert_eq!(
            manifest.steps,
            vec!["privileges", "preflight", "verify", "manifest"]
        );
    }

    #[test]
    fn manifest_requires_earlier_results() {
        let temp = TempDir::new().unwrap();
        let mut ctx = ctx_with(&temp, Box::new(Unreachable));
        assert!(WriteManifest.run(&mut ctx).is_err());
        assert!(!ctx.layout.manifest.exists());
    }
}
