//! Generic command execution steps

use super::{ApplyError, Condition, Step, StepContext, StepExt, StepInfo};
use crate::probe::ProbeError;
use crate::runner::{CommandError, Invocation};

/// Run a shell command with optional idempotency guard
#[derive(Debug, Clone)]
pub struct RunCommand {
    info: StepInfo,
    /// Command to execute with `sh -c`
    pub command: String,
    /// If this command succeeds (exit 0), skip running `command`
    pub unless: Option<String>,
}

impl RunCommand {
    /// Create a new command step, named after its description
    pub fn new(description: impl Into<String>, command: impl Into<String>) -> Self {
        let description = description.into();
        let name = description.to_lowercase().replace(' ', "-");
        Self {
            info: StepInfo::new(name, description),
            command: command.into(),
            unless: None,
        }
    }

    /// Add an idempotency guard
    pub fn unless(mut self, check: impl Into<String>) -> Self {
        self.unless = Some(check.into());
        self
    }

    fn shell(script: &str) -> Invocation {
        Invocation::new("sh").args(["-c", script])
    }

    fn check(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        let Some(unless) = &self.unless else {
            return Ok(Condition::NotSatisfied);
        };
        match ctx.probe().check_command(&Self::shell(unless)) {
            Ok(()) => Ok(Condition::Satisfied),
            Err(CommandError::NonZeroExit { .. }) => Ok(Condition::NotSatisfied),
            Err(source) => Err(ProbeError::Command {
                probe: "unless",
                source,
            }),
        }
    }
}

impl StepExt for RunCommand {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for RunCommand {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        self.check(ctx)
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        let out = ctx.run(&Self::shell(&self.command))?;
        Ok(out.stdout.trim().to_string())
    }

    fn postcondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        // Without a guard, a zero exit is all we can verify
        if self.unless.is_none() {
            return Ok(Condition::Satisfied);
        }
        self.check(ctx)
    }

    fn planned_actions(&self) -> Vec<String> {
        match &self.unless {
            Some(unless) => vec![format!("{} || {{ {}; }}", unless, self.command)],
            None => vec![self.command.clone()],
        }
    }
}
