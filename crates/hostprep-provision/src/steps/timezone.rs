//! System timezone

use super::{ApplyError, Condition, Step, StepContext, StepExt, StepInfo, describe};
use crate::probe::ProbeError;
use crate::runner::Invocation;

/// Set the system timezone through `timedatectl`
#[derive(Debug, Clone)]
pub struct SetTimezone {
    info: StepInfo,
    /// Olson identifier, e.g. `Europe/Paris`
    pub timezone: String,
}

impl SetTimezone {
    /// Create a new timezone step
    pub fn new(timezone: impl Into<String>) -> Self {
        let timezone = timezone.into();
        Self {
            info: StepInfo::new("set-timezone", format!("Set timezone to {timezone}")),
            timezone,
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new("timedatectl").args(["set-timezone", self.timezone.as_str()])
    }
}

impl StepExt for SetTimezone {
    fn info_mut(&mut self) -> &mut StepInfo {
        &mut self.info
    }
}

impl Step for SetTimezone {
    fn info(&self) -> &StepInfo {
        &self.info
    }

    fn precondition(&self, ctx: &StepContext<'_>) -> Result<Condition, ProbeError> {
        Ok(Condition::from_bool(ctx.probe().timezone_is(&self.timezone)?))
    }

    fn apply(&self, ctx: &StepContext<'_>) -> Result<String, ApplyError> {
        Ok(ctx.run_all(&[self.invocation()])?)
    }

    fn planned_actions(&self) -> Vec<String> {
        describe(&[self.invocation()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RunOptions;
    use crate::sim::SimHost;
    use std::time::Duration;

    #[test]
    fn test_sets_and_verifies_timezone() {
        let host = SimHost::fresh_debian();
        let ctx = StepContext::new(&host, RunOptions::live(Duration::from_secs(5)));
        let step = SetTimezone::new("Europe/Paris");
        assert_eq!(step.precondition(&ctx).unwrap(), Condition::NotSatisfied);
        step.apply(&ctx).unwrap();
        assert_eq!(step.postcondition(&ctx).unwrap(), Condition::Satisfied);
        assert_eq!(host.timezone(), "Europe/Paris");
    }

    #[test]
    fn test_ignored_change_fails_postcondition() {
        let host = SimHost::fresh_debian();
        host.ignore("timedatectl set-timezone");
        let ctx = StepContext::new(&host, RunOptions::live(Duration::from_secs(5)));
        let step = SetTimezone::new("Asia/Tokyo");
        step.apply(&ctx).unwrap();
        assert_eq!(step.postcondition(&ctx).unwrap(), Condition::NotSatisfied);
    }
}
