use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::Level;
use ovs_installer::{
    kmod, preflight, resolve_config, ConfigOverrides, InstallConfig, InstallContext,
    InstallLayout, InstallManifest, Pipeline,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (default: /etc/ovs-installer.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Open vSwitch release to install
    #[arg(long, global = true)]
    version_string: Option<String>,

    /// Download URL template; `{version}` is replaced with the release
    #[arg(long, global = true)]
    mirror_url: Option<String>,

    #[arg(long, global = true)]
    install_root: Option<PathBuf>,

    /// Expected SHA-256 of the release tarball
    #[arg(long, global = true)]
    sha256: Option<String>,

    /// Refuse to run without a configured --sha256
    #[arg(long, global = true)]
    require_checksum: bool,

    /// Build against this kernel release instead of the running one
    #[arg(long, global = true)]
    kernel_release: Option<String>,

    /// Parallel make jobs
    #[arg(long, global = true)]
    jobs: Option<u32>,

    /// Extra download attempts after the first
    #[arg(long, global = true)]
    retries: Option<u32>,

    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Download, build, and install Open vSwitch and load its kernel module
    Install,

    /// Show the resolved configuration and the steps an install would run
    ///
    /// Needs no privileges and changes nothing.
    Plan,

    /// Show the recorded install and whether the module is loaded
    Status,

    /// Unload the kernel module
    Unload,
}

impl Args {
    fn log_level(&self) -> Level {
        if self.verbose {
            Level::Debug
        } else if self.quiet {
            Level::Warn
        } else {
            Level::Info
        }
    }

    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            version: self.version_string.clone(),
            mirror_url: self.mirror_url.clone(),
            install_root: self.install_root.clone(),
            sha256: self.sha256.clone(),
            require_checksum: self.require_checksum.then_some(true),
            kernel_release: self.kernel_release.clone(),
            jobs: self.jobs,
            fetch_retries: self.retries,
            ..Default::default()
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level()).context("initialising logger")?;

    let command = args.command.unwrap_or(Command::Install);
    if matches!(command, Command::Install | Command::Unload) {
        preflight::check_privileges(preflight::effective_uid())?;
    }

    let config = resolve_config(args.config.as_deref(), args.overrides())?;

    match command {
        Command::Install => install(config),
        Command::Plan => plan(&config),
        Command::Status => status(&config),
        Command::Unload => unload(&config),
    }
}

fn install(config: InstallConfig) -> Result<()> {
    let mut ctx = InstallContext::new(config);
    Pipeline::standard().run(&mut ctx)?;
    println!("Done!!");
    Ok(())
}

fn plan(config: &InstallConfig) -> Result<()> {
    let layout = InstallLayout::new(config);

    println!("version:        {}", config.version);
    println!("download:       {}", layout.download_url);
    match &config.sha256 {
        Some(sha) => println!("sha256:         {sha}"),
        None => println!("sha256:         (recorded on first download)"),
    }
    println!("tarball:        {}", layout.tarball.display());
    println!("source tree:    {}", layout.source_tree.display());
    println!("prefix:         {}", layout.prefix.display());
    println!("module:         {}", config.module_name);
    println!("module copy:    {}", layout.installed_module.display());
    match &config.kernel_release {
        Some(release) => println!("kernel:         {release}"),
        None => println!("kernel:         (running kernel)"),
    }
    match config.jobs {
        Some(n) => println!("make jobs:      {n}"),
        None => println!("make jobs:      1"),
    }
    println!("fetch retries:  {}", config.fetch_retries);
    println!();

    let pipeline = Pipeline::standard();
    for (i, step) in pipeline.steps().enumerate() {
        println!(
            "  [{:>2}/{}] {:<16} {}",
            i + 1,
            pipeline.len(),
            step.id(),
            step.description()
        );
    }
    Ok(())
}

fn status(config: &InstallConfig) -> Result<()> {
    let layout = InstallLayout::new(config);

    match InstallManifest::load(&layout.manifest)? {
        Some(m) => {
            println!("installed:      {} ({})", m.version, m.installed_at_utc);
            println!("kernel:         {}", m.kernel_release);
            println!("prefix:         {}", m.prefix.display());
            println!("tarball sha256: {}", m.tarball_sha256);
            println!("module:         {} ({})", m.module_path.display(), m.module_sha256);
            if m.module_preloaded {
                println!("                (an older copy was already loaded at install time)");
            }
        }
        None => println!(
            "Open vSwitch {} is not installed under {}",
            config.version,
            layout.install_root.display()
        ),
    }

    let loaded = kmod::is_loaded(&config.module_name)?;
    println!(
        "module state:   {} {}",
        config.module_name,
        if loaded { "loaded" } else { "not loaded" }
    );
    Ok(())
}

fn unload(config: &InstallConfig) -> Result<()> {
    if !kmod::is_loaded(&config.module_name)? {
        println!("module {} is not loaded", config.module_name);
        return Ok(());
    }
    kmod::unload_module(&config.module_name)?;
    println!("Done!!");
    Ok(())
}
