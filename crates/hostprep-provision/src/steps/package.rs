//! Package manager steps

use std::time::Duration;

use super::{ApplyError, Condition, Step, StepContext, StepExt, StepInfo, apt_get, describe};
use crate::probe::{APT_UPDATE_STAMP, ProbeError};
use crate::runner::Invocation;

/// Keep existing config files when a package ships a new default
const KEEP_CONFIG: [&str; 4] = [
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "Dpkg::Options::=--force-confold",
];

/// Refresh the apt package index when it is older than `max_age`
///
/// Freshness is tracked by a stamp file touched after each successful update.
#[derive(Debug, Clone)]
pub struct UpdatePackageIndex {
    info: StepInfo,
    /// Index age that still counts as fresh
    pub max_age: Duration,
}

impl UpdatePackageIndex {
    /// Create a new index update step
    pub fn new(max_age: Duration) -> Self {
        Self {
            info: StepInfo::new("update-index", "Update package index"),
            max_age,
        }
    }

    fn invocations() -> Vec<Invocation> {
        let stamp_dir = APT_UPDATE_STAMP.rsplit_once('/').map_or("/", |(dir, _)| dir);
        vec![
            apt_get(["update"]),
            Invocation::new("install").args(["-d", "-m", "0755", stamp_dir]),
            Invocation::new("touch").arg(APT_UPDATE_STAMP),
        ]
    }
}

impl StepExt for UpdatePackageIndex {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for UpdatePackageIndex {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let age = ctx.probe().package_index_age()?;
        Ok(Condition::from_bool(age.is_some_and(|age| age <= self.max_age)))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        Ok(ctx.run_all(&Self::invocations())?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&Self::invocations())
    }
}

/// Upgrade every installed package
#[derive(Debug, Clone)]
pub struct UpgradePackages {
    info: StepInfo,
}

impl UpgradePackages {
    /// Create a new upgrade step
    pub fn new() -> Self {
        Self {
            info: StepInfo::new("upgrade-packages", "Upgrade installed packages"),
        }
    }

    fn invocation() -> Invocation {
        apt_get(["-y"]).args(KEEP_CONFIG).arg("upgrade")
    }
}

impl Default for UpgradePackages {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExt for UpgradePackages {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for UpgradePackages {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let pending = ctx.probe().upgradable_packages()?;
        Ok(Condition::from_bool(pending.is_empty()))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        let pending = match ctx.probe().upgradable_packages() {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "could not list upgradable packages");
                vec![]
            }
        };
        let ran = ctx.run_all(&[Self::invocation()])?;
        if pending.is_empty() {
            Ok(ran)
        } else {
            Ok(format!("{ran}\nupgraded: {}", pending.join(", ")))
        }
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&[Self::invocation()])
    }
}

/// Install a fixed set of apt packages
#[derive(Debug, Clone)]
pub struct InstallPackages {
    info: StepInfo,
    /// Package names
    pub packages: Vec<String>,
}

impl InstallPackages {
    /// Create a new package installation step
    pub fn new(packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let packages: Vec<String> = packages.into_iter().map(Into::into).collect();
        let description = format!("Install {}", packages.join(", "));
        Self {
            info: StepInfo::new("install-packages", description),
            packages,
        }
    }

    fn missing(&self, ctx: &StepContext<'_>) -> Result<Vec<String>, ProbeError> {
        let probe = ctx.probe();
        let mut missing = vec![];
        for pkg in &self.packages {
            if !probe.package_installed(pkg)? {
                missing.push(pkg.clone());
            }
        }
        Ok(missing)
    }

    fn invocation(packages: &[String]) -> Invocation {
        apt_get(["install", "-y"]).args(KEEP_CONFIG).args(packages)
    }
}

impl StepExt for InstallPackages {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for InstallPackages {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        Ok(Condition::from_bool(self.missing(ctx)?.is_empty()))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        // Only ask apt for what is missing; fall back to the full set if the
        // host cannot tell us
        let missing = match self.missing(ctx) {
            Ok(missing) => missing,
            Err(e) => {
                tracing::warn!(error = %e, "could not check installed packages, installing all");
                self.packages.clone()
            }
        };
        if missing.is_empty() {
            return Ok(String::new());
        }
        Ok(ctx.run_all(&[Self::invocation(&missing)])?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&[Self::invocation(&self.packages)])
    }
}

/// Remove downloaded archives from the apt cache
#[derive(Debug, Clone)]
pub struct CleanPackageCache {
    info: StepInfo,
}

impl CleanPackageCache {
    /// Create a new cache cleanup step
    pub fn new() -> Self {
        Self {
            info: StepInfo::new("clean-cache", "Clean package cache"),
        }
    }

    fn invocation() -> Invocation {
        apt_get(["clean"])
    }
}

impl Default for CleanPackageCache {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExt for CleanPackageCache {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for CleanPackageCache {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        Ok(Condition::from_bool(ctx.probe().cached_archives()?.is_empty()))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        Ok(ctx.run_all(&[Self::invocation()])?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&[Self::invocation()])
    }
}
