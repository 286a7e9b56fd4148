//! Ordered install pipeline.
//!
//! An install is a fixed sequence of [`Step`]s. The driver runs them in
//! order and stops at the first failure; steps after it never run. Steps
//! that already completed and can be undone (loading the kernel module) are
//! rolled back in reverse order before the failure is returned.
//!
//! # Example
//!
//! ```rust,ignore
//! use ovs_installer::pipeline::{InstallContext, Pipeline};
//!
//! let mut ctx = InstallContext::new(config);
//! match Pipeline::standard().run(&mut ctx) {
//!     Ok(report) => println!("installed {} steps", report.steps.len()),
//!     Err(failure) => eprintln!("{failure}: {:#}", failure.error),
//! }
//! ```

pub mod context;
pub mod steps;

use anyhow::Result;
use std::fmt;

pub use context::InstallContext;

/// One unit of the install.
pub trait Step {
    /// Short stable identifier used in logs, errors, and the manifest.
    fn id(&self) -> &'static str;

    /// One-line description for `plan` output.
    fn description(&self) -> &'static str;

    fn run(&self, ctx: &mut InstallContext) -> Result<()>;

    /// Whether [`Step::rollback`] undoes anything.
    fn reversible(&self) -> bool {
        false
    }

    /// Undo the effect of a completed [`Step::run`].
    fn rollback(&self, _ctx: &mut InstallContext) -> Result<()> {
        Ok(())
    }
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub steps: Vec<&'static str>,
}

/// The first failing step and what happened around it.
#[derive(Debug)]
pub struct PipelineFailure {
    pub step: &'static str,
    /// 1-based position of the failing step.
    pub index: usize,
    pub total: usize,
    pub completed: Vec<&'static str>,
    pub rolled_back: Vec<&'static str>,
    pub error: anyhow::Error,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "step {}/{} '{}' failed",
            self.index, self.total, self.step
        )?;
        if !self.rolled_back.is_empty() {
            write!(f, " (rolled back: {})", self.rolled_back.join(", "))?;
        }
        Ok(())
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// The full source install, in order.
    pub fn standard() -> Self {
        use steps::*;
        Self::new(vec![
            Box::new(PrivilegeCheck),
            Box::new(Preflight),
            Box::new(PrepareDirectories),
            Box::new(Fetch),
            Box::new(Extract),
            Box::new(Configure),
            Box::new(Compile),
            Box::new(Install),
            Box::new(InstallModules),
            Box::new(LoadModule),
            Box::new(CopyModule),
            Box::new(Verify),
            Box::new(WriteManifest),
        ])
    }

    pub fn steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.steps.iter().map(|s| s.as_ref())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(&self, ctx: &mut InstallContext) -> std::result::Result<InstallReport, PipelineFailure> {
        let total = self.steps.len();

        for (i, step) in self.steps.iter().enumerate() {
            log::info!("[{}/{}] {}", i + 1, total, step.id());

            if let Err(error) = step.run(ctx) {
                log::error!("step '{}' failed: {:#}", step.id(), error);
                let rolled_back = self.roll_back(i, ctx);
                return Err(PipelineFailure {
                    step: step.id(),
                    index: i + 1,
                    total,
                    completed: ctx.completed.clone(),
                    rolled_back,
                    error,
                });
            }

            ctx.completed.push(step.id());
        }

        Ok(InstallReport {
            steps: ctx.completed.clone(),
        })
    }

    /// Undo completed reversible steps before `failed`, newest first.
    fn roll_back(&self, failed: usize, ctx: &mut InstallContext) -> Vec<&'static str> {
        let mut rolled_back = Vec::new();
        for step in self.steps[..failed].iter().rev() {
            if !step.reversible() {
                continue;
            }
            log::warn!("rolling back '{}'", step.id());
            match step.rollback(ctx) {
                Ok(()) => rolled_back.push(step.id()),
                Err(e) => log::error!("rollback of '{}' failed: {:#}", step.id(), e),
            }
        }
        rolled_back
    }
}
