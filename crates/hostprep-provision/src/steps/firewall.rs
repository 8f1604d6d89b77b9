//! Firewall (UFW) management

use super::{ApplyError, Condition, Step, StepContext, StepExt, StepInfo, describe};
use crate::config::FirewallRule;
use crate::probe::ProbeError;
use crate::runner::Invocation;

/// Ensure UFW is enabled with deny-incoming defaults and the given allow rules
#[derive(Debug, Clone)]
pub struct EnsureFirewall {
    info: StepInfo,
    /// Inbound rules to allow
    pub rules: Vec<FirewallRule>,
    /// Wipe existing rules before applying
    pub reset: bool,
}

impl EnsureFirewall {
    /// Create a new firewall step
    pub fn new(rules: impl IntoIterator<Item = FirewallRule>) -> Self {
        let rules: Vec<FirewallRule> = rules.into_iter().collect();
        let listed: Vec<String> = rules.iter().map(ToString::to_string).collect();
        Self {
            info: StepInfo::new(
                "firewall",
                format!("Enable firewall allowing {}", listed.join(", ")),
            ),
            rules,
            reset: false,
        }
    }

    /// Reset all existing rules first
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    fn invocations(&self) -> Vec<Invocation> {
        let ufw = || Invocation::new("ufw");
        let mut cmds = vec![];
        if self.reset {
            cmds.push(ufw().args(["--force", "reset"]));
        }
        cmds.push(ufw().args(["default", "deny", "incoming"]));
        cmds.push(ufw().args(["default", "allow", "outgoing"]));
        // Allow rules precede enable so the SSH session survives activation
        for rule in &self.rules {
            cmds.push(ufw().args(["allow".to_string(), rule.to_string()]));
        }
        cmds.push(ufw().args(["--force", "enable"]));
        cmds
    }
}

impl StepExt for EnsureFirewall {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for EnsureFirewall {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let probe = ctx.probe();
        // Before the package step runs there is no ufw to ask
        if !probe.package_installed("ufw")? {
            return Ok(Condition::NotSatisfied);
        }
        Ok(Condition::from_bool(probe.firewall_enforces(&self.rules)?))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        Ok(ctx.run_all(&self.invocations())?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&self.invocations())
    }
}
