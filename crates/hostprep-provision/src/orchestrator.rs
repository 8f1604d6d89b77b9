//! Sequential execution of a validated plan
//!
//! For each step, in registry order: check dependencies, evaluate the
//! precondition, apply (unless dry-run), then verify the postcondition. No
//! error from a probe or an apply ever escapes [`Orchestrator::run`]; every
//! step ends up as exactly one [`StepResult`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::config::{FailurePolicy, ProvisionConfig};
use crate::registry::StepRegistry;
use crate::report::{Outcome, ReportBuilder, RunReport, RunStatus, SkipReason, StepResult};
use crate::runner::{CommandRunner, RunOptions};
use crate::steps::{Condition, Step, StepContext};

/// Lifecycle of an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

/// Cooperative cancellation flag, checked between steps
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create an unset signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Request that no further step starts
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callbacks
pub trait RunObserver {
    /// A step is about to be evaluated
    fn step_started(&self, _index: usize, _total: usize, _step: &dyn Step) {}

    /// A step has its final outcome
    fn step_finished(&self, _index: usize, _total: usize, _result: &StepResult) {}
}

/// Run-wide settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSettings {
    pub policy: FailurePolicy,
    pub dry_run: bool,
    pub timeout: Duration,
}

impl RunSettings {
    /// Settings taken from a provisioning config
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            policy: config.policy,
            dry_run: config.dry_run,
            timeout: config.timeout,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from_config(&ProvisionConfig::default())
    }
}

/// Drives a [`StepRegistry`] against a host
pub struct Orchestrator<'a> {
    registry: StepRegistry,
    runner: &'a dyn CommandRunner,
    settings: RunSettings,
    stop: StopSignal,
    observer: Option<&'a dyn RunObserver>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    /// Create a new orchestrator
    pub fn new(registry: StepRegistry, runner: &'a dyn CommandRunner, settings: RunSettings) -> Self {
        Self {
            registry,
            runner,
            settings,
            stop: StopSignal::new(),
            observer: None,
            state: RunState::Idle,
        }
    }

    /// Share a stop signal with the caller
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Receive progress callbacks
    pub fn with_observer(mut self, observer: &'a dyn RunObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> RunState {
        self.state
    }

    /// The plan being executed
    pub fn registry(&self) -> &StepRegistry {
        &self.registry
    }

    /// Execute every step and build the report
    pub fn run(&mut self) -> RunReport {
        self.state = RunState::Running;
        let started_at = Utc::now();
        let ctx = StepContext::new(
            self.runner,
            RunOptions {
                dry_run: self.settings.dry_run,
                timeout: self.settings.timeout,
            },
        );

        tracing::info!(
            steps = self.registry.len(),
            policy = %self.settings.policy,
            dry_run = self.settings.dry_run,
            "starting run"
        );

        let total = self.registry.len();
        let mut outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut results = Vec::with_capacity(total);
        let mut halted: Option<String> = None;

        for (index, step) in self.registry.steps().iter().enumerate() {
            if halted.is_none() && self.stop.is_stopped() {
                tracing::warn!(step = step.name(), "stop requested, aborting remaining steps");
                halted = Some("run cancelled".into());
            }

            let result = match &halted {
                Some(reason) => StepResult::new(step.name(), Outcome::Aborted, reason.clone()),
                None => {
                    if let Some(observer) = self.observer {
                        observer.step_started(index, total, step.as_ref());
                    }
                    self.execute(step.as_ref(), &ctx, &outcomes)
                }
            };

            log_result(&result);
            if let Some(observer) = self.observer {
                observer.step_finished(index, total, &result);
            }

            if result.outcome == Outcome::Failed
                && self.settings.policy == FailurePolicy::FailFast
                && halted.is_none()
            {
                halted = Some(format!("aborted after {} failed", step.name()));
            }

            outcomes.insert(step.name().to_string(), result.outcome);
            results.push(result);
        }

        let report = ReportBuilder::new()
            .dry_run(self.settings.dry_run)
            .started_at(started_at)
            .build(results, self.settings.policy);

        self.state = match report.status {
            RunStatus::Aborted => RunState::Aborted,
            RunStatus::AllApplied | RunStatus::PartialFailure => RunState::Completed,
        };
        tracing::info!(status = %report.status, "run finished");
        report
    }

    fn execute(
        &self,
        step: &dyn Step,
        ctx: &StepContext<'_>,
        outcomes: &HashMap<String, Outcome>,
    ) -> StepResult {
        let name = step.name();

        let blocker = step
            .depends_on()
            .iter()
            .find(|dep| !outcomes.get(dep.as_str()).is_some_and(|o| o.is_success()));
        if let Some(dep) = blocker {
            return StepResult::new(
                name,
                Outcome::Skipped(SkipReason::Blocked),
                format!("blocked by {dep}"),
            );
        }

        match step.precondition(ctx) {
            Ok(Condition::Satisfied) => {
                return StepResult::new(name, Outcome::Skipped(SkipReason::AlreadySatisfied), "");
            }
            Ok(Condition::NotSatisfied) => {}
            Err(e) => {
                return StepResult::new(name, Outcome::Failed, format!("state unknown: {e}"));
            }
        }

        if self.settings.dry_run {
            return StepResult::new(
                name,
                Outcome::Skipped(SkipReason::DryRun),
                step.planned_actions().join("\n"),
            );
        }

        tracing::debug!(step = name, "applying");
        let detail = match step.apply(ctx) {
            Ok(detail) => detail,
            Err(e) => return StepResult::new(name, Outcome::Failed, e.to_string()),
        };

        match step.postcondition(ctx) {
            Ok(Condition::Satisfied) => StepResult::new(name, Outcome::Applied, detail),
            Ok(Condition::NotSatisfied) => StepResult::new(
                name,
                Outcome::Failed,
                join_detail("postcondition not met", &detail),
            ),
            Err(e) => StepResult::new(
                name,
                Outcome::Failed,
                join_detail(&format!("state unknown after apply: {e}"), &detail),
            ),
        }
    }
}

fn join_detail(headline: &str, detail: &str) -> String {
    if detail.is_empty() {
        headline.to_string()
    } else {
        format!("{headline}\n{detail}")
    }
}

fn log_result(result: &StepResult) {
    match result.outcome {
        Outcome::Failed => {
            tracing::warn!(step = %result.step_name, detail = %result.detail, "step failed");
        }
        Outcome::Aborted => {
            tracing::debug!(step = %result.step_name, "step aborted");
        }
        outcome => {
            tracing::info!(step = %result.step_name, outcome = %outcome, "step finished");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{self, debian_plan};
    use crate::registry::PlanError;
    use crate::secret::SecretValue;
    use crate::sim::SimHost;
    use crate::steps::{RunCommand, StepExt};

    fn settings(policy: FailurePolicy, dry_run: bool) -> RunSettings {
        RunSettings {
            policy,
            dry_run,
            timeout: Duration::from_secs(5),
        }
    }

    fn config() -> ProvisionConfig {
        ProvisionConfig::builder()
            .admin_user("alice")
            .ssh_keys(["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIExample alice@laptop"])
            .ssh_port(2222)
            .timezone("Europe/Paris")
            .build()
    }

    fn plan() -> StepRegistry {
        debian_plan(&config(), Some(SecretValue::new("a long enough password"))).unwrap()
    }

    fn outcomes(report: &RunReport) -> Vec<Outcome> {
        report.results.iter().map(|r| r.outcome).collect()
    }

    fn command(name: &str, script: &str) -> Box<dyn Step> {
        Box::new(RunCommand::new(name, script).named(name))
    }

    #[test]
    fn test_fresh_host_is_fully_provisioned() {
        let host = SimHost::fresh_debian();
        let mut orchestrator =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::FailFast, false));
        let report = orchestrator.run();
        assert_eq!(report.status, RunStatus::AllApplied, "{report:#?}");
        assert_eq!(report.counts().applied, 10);
        assert_eq!(orchestrator.state(), RunState::Completed);
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_second_run_changes_nothing() {
        let host = SimHost::fresh_debian();
        Orchestrator::new(plan(), &host, settings(FailurePolicy::FailFast, false)).run();

        let again = debian_plan(&config(), None).unwrap();
        let report =
            Orchestrator::new(again, &host, settings(FailurePolicy::FailFast, false)).run();
        assert_eq!(report.status, RunStatus::AllApplied);
        assert!(
            outcomes(&report)
                .iter()
                .all(|o| *o == Outcome::Skipped(SkipReason::AlreadySatisfied)),
            "{report:#?}"
        );
    }

    #[test]
    fn test_dry_run_never_mutates() {
        let host = SimHost::fresh_debian();
        let mut orchestrator =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::FailFast, true));
        let report = orchestrator.run();

        assert!(host.mutating_calls().is_empty(), "{:?}", host.mutating_calls());
        assert!(
            outcomes(&report)
                .iter()
                .all(|o| *o == Outcome::Skipped(SkipReason::DryRun)),
            "{report:#?}"
        );
        assert!(report.dry_run);
        assert_eq!(report.status, RunStatus::AllApplied);
        assert!(
            report
                .get(plan::FIREWALL)
                .unwrap()
                .detail
                .contains("ufw allow 2222/tcp")
        );
        assert!(!host.has_file("/etc/fail2ban/jail.local"));
    }

    #[test]
    fn test_failed_dependency_blocks_dependents_transitively() {
        let host = SimHost::fresh_debian();
        host.fail_on("apt-get install", 100);
        let report =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::BestEffort, false)).run();

        let outcome = |name: &str| report.get(name).unwrap().outcome;
        assert_eq!(outcome(plan::INSTALL_PACKAGES), Outcome::Failed);
        for blocked in [
            plan::ADMIN_USER,
            plan::SSH_POLICY,
            plan::FIREWALL,
            plan::FAIL2BAN,
            plan::UNATTENDED_UPGRADES,
            plan::CLEAN_CACHE,
        ] {
            assert_eq!(outcome(blocked), Outcome::Skipped(SkipReason::Blocked), "{blocked}");
        }
        assert_eq!(outcome(plan::SET_TIMEZONE), Outcome::Applied);
        assert_eq!(outcome(plan::UPGRADE_PACKAGES), Outcome::Applied);
        assert_eq!(
            report.get(plan::SSH_POLICY).unwrap().detail,
            "blocked by admin-user"
        );
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert!(!host.ran("useradd"));
    }

    #[test]
    fn test_fail_fast_aborts_remaining_steps() {
        let host = SimHost::fresh_debian();
        let registry = StepRegistry::new(vec![
            command("a", "true"),
            command("b", "exit 1"),
            command("c", "true"),
        ])
        .unwrap();
        let mut orchestrator =
            Orchestrator::new(registry, &host, settings(FailurePolicy::FailFast, false));
        let report = orchestrator.run();
        assert_eq!(
            outcomes(&report),
            vec![Outcome::Applied, Outcome::Failed, Outcome::Aborted]
        );
        assert_eq!(report.status, RunStatus::Aborted);
        assert_eq!(orchestrator.state(), RunState::Aborted);
        assert_eq!(report.results[2].detail, "aborted after b failed");
    }

    #[test]
    fn test_best_effort_continues_past_failure() {
        let host = SimHost::fresh_debian();
        let registry = StepRegistry::new(vec![
            command("a", "true"),
            command("b", "exit 1"),
            command("c", "true"),
        ])
        .unwrap();
        let mut orchestrator =
            Orchestrator::new(registry, &host, settings(FailurePolicy::BestEffort, false));
        let report = orchestrator.run();
        assert_eq!(
            outcomes(&report),
            vec![Outcome::Applied, Outcome::Failed, Outcome::Applied]
        );
        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(orchestrator.state(), RunState::Completed);
        assert!(report.results[1].detail.contains("exited with code 1"));
    }

    /// Validate `steps` and run them against `host`, as the binary does
    fn run_steps(
        steps: Vec<Box<dyn Step>>,
        host: &SimHost,
        settings: RunSettings,
    ) -> Result<RunReport, PlanError> {
        let registry = StepRegistry::new(steps)?;
        Ok(Orchestrator::new(registry, host, settings).run())
    }

    #[test]
    fn test_invalid_plan_runs_nothing() {
        let host = SimHost::fresh_debian();
        let steps: Vec<Box<dyn Step>> = vec![
            command("a", "touch /srv/a"),
            Box::new(RunCommand::new("b", "touch /srv/b").named("b").after(["ghost"])),
        ];
        let result = run_steps(steps, &host, settings(FailurePolicy::BestEffort, false));
        assert!(matches!(
            result,
            Err(PlanError::UnknownDependency { ref step, ref dependency })
                if step == "b" && dependency == "ghost"
        ));
        assert!(host.calls().is_empty());
        assert!(!host.has_file("/srv/a"));

        let steps: Vec<Box<dyn Step>> = vec![command("a", "touch /srv/a")];
        let report = run_steps(steps, &host, settings(FailurePolicy::BestEffort, false)).unwrap();
        assert_eq!(outcomes(&report), vec![Outcome::Applied]);
        assert!(host.has_file("/srv/a"));
    }

    #[test]
    fn test_unmet_postcondition_is_failure() {
        let host = SimHost::fresh_debian();
        host.ignore("timedatectl set-timezone");
        let report =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::BestEffort, false)).run();
        let result = report.get(plan::SET_TIMEZONE).unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.detail.starts_with("postcondition not met"));
        assert_eq!(report.status, RunStatus::PartialFailure);
    }

    #[test]
    fn test_probe_error_is_state_unknown() {
        let host = SimHost::fresh_debian();
        host.override_stdout("timedatectl", "");
        let report =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::BestEffort, false)).run();
        let result = report.get(plan::SET_TIMEZONE).unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.detail.starts_with("state unknown"));
        assert!(!host.ran("timedatectl set-timezone"));
    }

    #[test]
    fn test_timeout_is_failure() {
        let host = SimHost::fresh_debian();
        host.hang_on("apt-get update");
        let report =
            Orchestrator::new(plan(), &host, settings(FailurePolicy::FailFast, false)).run();
        let result = report.get(plan::UPDATE_INDEX).unwrap();
        assert_eq!(result.outcome, Outcome::Failed);
        assert!(result.detail.contains("timed out"));
        assert_eq!(report.counts().aborted, 9);
    }

    struct StopAfterFirst(StopSignal);

    impl RunObserver for StopAfterFirst {
        fn step_finished(&self, index: usize, _total: usize, _result: &StepResult) {
            if index == 0 {
                self.0.stop();
            }
        }
    }

    #[test]
    fn test_stop_signal_aborts_between_steps() {
        let host = SimHost::fresh_debian();
        let stop = StopSignal::new();
        let observer = StopAfterFirst(stop.clone());
        let registry = StepRegistry::new(vec![
            command("a", "touch /srv/a"),
            command("b", "touch /srv/b"),
            command("c", "touch /srv/c"),
        ])
        .unwrap();
        let mut orchestrator =
            Orchestrator::new(registry, &host, settings(FailurePolicy::BestEffort, false))
                .with_stop_signal(stop)
                .with_observer(&observer);
        let report = orchestrator.run();
        assert_eq!(
            outcomes(&report),
            vec![Outcome::Applied, Outcome::Aborted, Outcome::Aborted]
        );
        assert_eq!(report.results[1].detail, "run cancelled");
        assert!(!host.has_file("/srv/b"));
        assert_eq!(orchestrator.state(), RunState::Aborted);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let host = SimHost::fresh_debian();
        let registry = StepRegistry::new(vec![Box::new(
            RunCommand::new("marker", "touch /srv/marker")
                .unless("test -e /srv/marker")
                .named("marker"),
        ) as Box<dyn Step>])
        .unwrap();
        let mut orchestrator =
            Orchestrator::new(registry, &host, settings(FailurePolicy::FailFast, false));
        assert_eq!(outcomes(&orchestrator.run()), vec![Outcome::Applied]);
        assert_eq!(
            outcomes(&orchestrator.run()),
            vec![Outcome::Skipped(SkipReason::AlreadySatisfied)]
        );
    }
}
