//! Provisioning step definitions
//!
//! Each step implements the [`Step`] trait: a precondition queried against the
//! live host, an apply action, and a postcondition that re-checks the host
//! after applying.

mod command;
mod file;
mod firewall;
mod package;
mod service;
mod ssh;
mod timezone;
mod user;

pub use command::RunCommand;
pub use file::ManagedFile;
pub use firewall::EnsureFirewall;
pub use package::{CleanPackageCache, InstallPackages, UpdatePackageIndex, UpgradePackages};
pub use service::ConfigureService;
pub use ssh::SshAccessPolicy;
pub use timezone::SetTimezone;
pub use user::EnsureAdminUser;

use thiserror::Error;

use crate::probe::{ProbeError, StateProbe};
use crate::runner::{CommandError, CommandOutput, CommandRunner, Invocation, RunOptions};

/// Answer of a precondition or postcondition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// The host is already in the desired state
    Satisfied,
    /// Applying the step is required
    NotSatisfied,
}

impl Condition {
    /// `Satisfied` when `ok` is true
    pub fn from_bool(ok: bool) -> Self {
        if ok { Self::Satisfied } else { Self::NotSatisfied }
    }

    /// Whether this is `Satisfied`
    pub fn is_satisfied(self) -> bool {
        self == Self::Satisfied
    }
}

/// Why applying a step failed
#[derive(Debug, Error)]
pub enum ApplyError {
    /// An external command failed or could not be run
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Host state needed to decide what to run could not be determined
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// A required input was not provided
    #[error("{0}")]
    MissingInput(String),
}

/// Identity and ordering of a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepInfo {
    /// Unique identifier within a plan
    pub name: String,
    /// Human-readable description
    pub description: String,
    /// Steps that must complete successfully first
    pub depends_on: Vec<String>,
}

impl StepInfo {
    /// Create step metadata without dependencies
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            depends_on: vec![],
        }
    }
}

/// Host access handed to steps.
///
/// Mutating commands go through [`StepContext::run`], which honours dry-run
/// mode. Checks go through [`StepContext::probe`], which never does.
pub struct StepContext<'a> {
    runner: &'a dyn CommandRunner,
    options: RunOptions,
}

impl<'a> StepContext<'a> {
    /// Create a context over `runner`
    pub fn new(runner: &'a dyn CommandRunner, options: RunOptions) -> Self {
        Self { runner, options }
    }

    /// Read-only host queries
    pub fn probe(&self) -> StateProbe<'a> {
        StateProbe::new(self.runner, self.options.timeout)
    }

    /// Whether mutating commands are suppressed
    pub fn dry_run(&self) -> bool {
        self.options.dry_run
    }

    /// Run a mutating command
    pub fn run(&self, invocation: &Invocation) -> Result<CommandOutput, CommandError> {
        self.runner.run(invocation, &self.options)
    }

    /// Run commands in order, stopping at the first failure.
    ///
    /// Returns the executed command lines, one per line, as step detail.
    pub fn run_all(&self, invocations: &[Invocation]) -> Result<String, CommandError> {
        let mut ran = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            self.run(invocation)?;
            ran.push(invocation.display());
        }
        Ok(ran.join("\n"))
    }
}

/// A single provisioning step
///
/// All steps must be:
/// - **Idempotent**: `apply` is skipped whenever `precondition` is satisfied
/// - **Verifiable**: `postcondition` re-queries the host after `apply`
/// - **Describable**: `planned_actions` lists what `apply` would run
pub trait Step: Send + Sync {
    /// Identity and dependencies
    fn info(&self) -> &StepInfo;

    /// Unique step name
    fn name(&self) -> &str {
        &self.info().name
    }

    /// Human-readable description of what this step does
    fn description(&self) -> &str {
        &self.info().description
    }

    /// Steps that must complete successfully first
    fn depends_on(&self) -> &[String] {
        &self.info().depends_on
    }

    /// Whether the host already satisfies this step
    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError>;

    /// Change the host. Returns detail for the report.
    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError>;

    /// Whether the host is in the desired state after `apply`.
    ///
    /// Defaults to re-evaluating the precondition.
    fn postcondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        self.precondition(ctx)
    }

    /// Commands `apply` would run, for dry runs and plan listings
    fn planned_actions(&self) -> Vec<String>;
}

/// Fluent naming and dependency declaration for concrete steps
pub trait StepExt: Sized {
    /// Mutable access to the step metadata
    fn info_mut(&mut self) -> &mut StepInfo;

    /// Override the step name
    fn named(mut self, name: impl Into<String>) -> Self {
        self.info_mut().name = name.into();
        self
    }

    /// Override the description
    fn described(mut self, description: impl Into<String>) -> Self {
        self.info_mut().description = description.into();
        self
    }

    /// Require these steps to complete first
    fn after(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.info_mut().depends_on = deps.into_iter().map(Into::into).collect();
        self
    }
}

/// Display form of each invocation
pub(crate) fn describe(invocations: &[Invocation]) -> Vec<String> {
    invocations.iter().map(Invocation::display).collect()
}

/// Invocation with the environment apt needs to never prompt
pub(crate) fn apt_get(args: impl IntoIterator<Item = impl Into<String>>) -> Invocation {
    Invocation::new("apt-get")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .args(args)
}

/// `systemctl <verb> <unit>`
pub(crate) fn systemctl(verb: &str, unit: &str) -> Invocation {
    Invocation::new("systemctl").args([verb, unit])
}
