//! Hostprep Provision - Idempotent Host Hardening Engine
//!
//! This crate brings a fresh Debian host to a known baseline: packages,
//! timezone, an admin account, SSH policy, firewall, fail2ban and unattended
//! upgrades. Every step checks the live host before and after it acts, so a
//! second run against a provisioned host changes nothing.
//!
//! # Architecture
//!
//! - [`CommandRunner`]: the only path to the host ([`SystemRunner`] in production)
//! - [`StateProbe`]: read-only host queries, never affected by dry-run
//! - [`Step`] trait and [`steps`] module: precondition / apply / postcondition units
//! - [`StepRegistry`]: validated plan in dependency order
//! - [`Orchestrator`]: executes a plan under a [`FailurePolicy`]
//! - [`RunReport`]: per-step outcomes and overall status
//!
//! # Example
//!
//! ```ignore
//! use hostprep_provision::{Orchestrator, ProvisionConfig, RunSettings, SystemRunner, plan};
//!
//! let config = ProvisionConfig::builder()
//!     .admin_user("ops")
//!     .ssh_port(2222)
//!     .dry_run(true)
//!     .build();
//!
//! let registry = plan::debian_plan(&config, None)?;
//! let runner = SystemRunner::new();
//! let report = Orchestrator::new(registry, &runner, RunSettings::from_config(&config)).run();
//! ```

pub mod config;
pub mod orchestrator;
pub mod plan;
pub mod probe;
pub mod registry;
pub mod report;
pub mod runner;
pub mod secret;
pub mod steps;
pub mod templates;

#[cfg(test)]
pub(crate) mod sim;

pub use config::{ConfigError, FailurePolicy, FirewallRule, PasswordAuth, Protocol, ProvisionConfig};
pub use orchestrator::{Orchestrator, RunObserver, RunSettings, RunState, StopSignal};
pub use probe::{HostFacts, ProbeError, StateProbe};
pub use registry::{PlanError, StepRegistry};
pub use report::{Outcome, ReportBuilder, RunReport, RunStatus, SkipReason, StepResult};
pub use runner::{CommandError, CommandOutput, CommandRunner, Invocation, RunOptions, SystemRunner};
pub use secret::{SecretPrompt, SecretSource, SecretValue, TerminalSource};
pub use steps::{Condition, Step};
