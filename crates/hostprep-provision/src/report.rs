//! Run outcomes and the final report

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FailurePolicy;

/// Why a step was skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    /// The host already satisfied the precondition
    AlreadySatisfied,
    /// A dependency did not complete successfully
    Blocked,
    /// Dry-run mode; the step would have been applied
    DryRun,
}

/// What happened to one step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "kebab-case")]
pub enum Outcome {
    /// The step changed the host and its postcondition holds
    Applied,
    /// The step did not run
    Skipped(SkipReason),
    /// The step ran, or its state could not be determined, and it did not succeed
    Failed,
    /// The run stopped before reaching this step
    Aborted,
}

impl Outcome {
    /// Whether dependents may proceed
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Applied
                | Self::Skipped(SkipReason::AlreadySatisfied | SkipReason::DryRun)
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Applied => "applied",
            Self::Skipped(SkipReason::AlreadySatisfied) => "ok",
            Self::Skipped(SkipReason::Blocked) => "blocked",
            Self::Skipped(SkipReason::DryRun) => "would apply",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        })
    }
}

/// Result of one step within a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub outcome: Outcome,
    /// Commands run, planned actions, or error output
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    /// Create a result stamped now
    pub fn new(step_name: impl Into<String>, outcome: Outcome, detail: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            outcome,
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Every step succeeded or was already satisfied
    AllApplied,
    /// Some steps failed, the rest ran to completion
    PartialFailure,
    /// The run stopped early
    Aborted,
}

impl RunStatus {
    /// Overall status for `results` under `policy`
    pub fn from_results(results: &[StepResult], policy: FailurePolicy) -> Self {
        let any = |o: Outcome| results.iter().any(|r| r.outcome == o);
        if any(Outcome::Aborted) || (policy == FailurePolicy::FailFast && any(Outcome::Failed)) {
            Self::Aborted
        } else if any(Outcome::Failed) {
            Self::PartialFailure
        } else {
            Self::AllApplied
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AllApplied => "all applied",
            Self::PartialFailure => "partial failure",
            Self::Aborted => "aborted",
        })
    }
}

/// Tally of outcomes in a report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeCounts {
    pub applied: usize,
    pub already_satisfied: usize,
    pub blocked: usize,
    pub dry_run: usize,
    pub failed: usize,
    pub aborted: usize,
}

/// Ordered results of a run plus its overall status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub policy: FailurePolicy,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// One entry per registered step, in execution order
    pub results: Vec<StepResult>,
}

impl RunReport {
    /// Count outcomes by kind
    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for result in &self.results {
            match result.outcome {
                Outcome::Applied => counts.applied += 1,
                Outcome::Skipped(SkipReason::AlreadySatisfied) => counts.already_satisfied += 1,
                Outcome::Skipped(SkipReason::Blocked) => counts.blocked += 1,
                Outcome::Skipped(SkipReason::DryRun) => counts.dry_run += 1,
                Outcome::Failed => counts.failed += 1,
                Outcome::Aborted => counts.aborted += 1,
            }
        }
        counts
    }

    /// Steps that changed the host
    pub fn changed(&self) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Applied)
            .collect()
    }

    /// Steps that failed
    pub fn failed(&self) -> Vec<&StepResult> {
        self.results
            .iter()
            .filter(|r| r.outcome == Outcome::Failed)
            .collect()
    }

    /// Result for a step by name
    pub fn get(&self, step_name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_name == step_name)
    }

    /// Process exit code: 0 when everything applied, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::AllApplied => 0,
            RunStatus::PartialFailure | RunStatus::Aborted => 1,
        }
    }
}

/// Assembles a [`RunReport`] from step results
#[derive(Debug, Clone)]
pub struct ReportBuilder {
    dry_run: bool,
    started_at: DateTime<Utc>,
}

impl ReportBuilder {
    /// Start a report now
    pub fn new() -> Self {
        Self {
            dry_run: false,
            started_at: Utc::now(),
        }
    }

    /// Mark the report as a dry run
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Override the start time
    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = at;
        self
    }

    /// Finish the report
    pub fn build(self, results: Vec<StepResult>, policy: FailurePolicy) -> RunReport {
        RunReport {
            status: RunStatus::from_results(&results, policy),
            policy,
            dry_run: self.dry_run,
            started_at: self.started_at,
            finished_at: Utc::now(),
            results,
        }
    }
}

impl Default for ReportBuilder {
    fn default() -> Self {
        Self::new()
    }
}
