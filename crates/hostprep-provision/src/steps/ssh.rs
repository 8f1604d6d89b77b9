//! SSH daemon access policy

use super::{
    ApplyError, Condition, ManagedFile, Step, StepContext, StepExt, StepInfo, describe, systemctl,
};
use crate::probe::ProbeError;
use crate::runner::Invocation;

/// Install an sshd drop-in, validate it, and restart the daemon
#[derive(Debug, Clone)]
pub struct SshAccessPolicy {
    info: StepInfo,
    /// The drop-in fragment
    pub fragment: ManagedFile,
    /// systemd unit of the SSH daemon
    pub service: String,
}

impl SshAccessPolicy {
    /// Create a new SSH policy step
    pub fn new(fragment: ManagedFile, service: impl Into<String>) -> Self {
        Self {
            info: StepInfo::new("ssh-policy", "Configure SSH access policy"),
            fragment,
            service: service.into(),
        }
    }

    fn validate() -> Invocation {
        Invocation::new("sshd").arg("-t")
    }

    fn remove_fragment(&self) -> Invocation {
        Invocation::new("rm").args(["-f", self.fragment.path.as_str()])
    }
}

impl StepExt for SshAccessPolicy {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for SshAccessPolicy {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let probe = ctx.probe();
        Ok(Condition::from_bool(
            self.fragment.matches(&probe)? && probe.service_active(&self.service)?,
        ))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        let mut detail = ctx.run_all(&self.fragment.invocations())?;

        // A fragment sshd rejects must not survive until the next restart
        if let Err(e) = ctx.run(&Self::validate()) {
            tracing::warn!(path = %self.fragment.path, "sshd rejected configuration, removing fragment");
            ctx.run(&self.remove_fragment())?;
            return Err(e.into());
        }
        detail.push('\n');
        detail.push_str(&Self::validate().display());

        detail.push('\n');
        detail.push_str(&ctx.run_all(&[systemctl("restart", &self.service)])?);
        Ok(detail)
    }

    fn planned_actions(&self) -> Vec<String> {
        let mut cmds = self.fragment.invocations();
        cmds.push(Self::validate());
        cmds.push(systemctl("restart", &self.service));
        describe(&cmds)
    }
}
