//! Configured systemd services

use super::{
    ApplyError, Condition, ManagedFile, Step, StepContext, StepExt, StepInfo, describe, systemctl,
};
use crate::probe::ProbeError;
use crate::runner::Invocation;

/// Write a service's configuration file, then enable and restart it
#[derive(Debug, Clone)]
pub struct ConfigureService {
    info: StepInfo,
    /// Configuration owned by this step
    pub file: ManagedFile,
    /// systemd unit name
    pub service: String,
}

impl ConfigureService {
    /// Create a new service configuration step
    pub fn new(name: impl Into<String>, service: impl Into<String>, file: ManagedFile) -> Self {
        let service = service.into();
        Self {
            info: StepInfo::new(name, format!("Configure and enable {service}")),
            file,
            service,
        }
    }

    fn invocations(&self) -> Vec<Invocation> {
        let mut cmds = self.file.invocations();
        cmds.push(systemctl("enable", &self.service));
        cmds.push(systemctl("restart", &self.service));
        cmds
    }
}

impl StepExt for ConfigureService {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for ConfigureService {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let probe = ctx.probe();
        let ok = self.file.matches(&probe)?
            && probe.service_enabled(&self.service)?
            && probe.service_active(&self.service)?;
        Ok(Condition::from_bool(ok))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        Ok(ctx.run_all(&self.invocations())?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&self.invocations())
    }
}
