//! Validated, ordered collection of steps

use std::collections::HashSet;

use thiserror::Error;

use crate::steps::Step;

/// A plan that must not be executed
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("step with an empty name")]
    EmptyName,

    #[error("duplicate step name: {0}")]
    DuplicateStep(String),

    #[error("step {step} depends on unknown step {dependency}")]
    UnknownDependency { step: String, dependency: String },

    #[error("step {0} depends on itself")]
    SelfDependency(String),

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("failed to render configuration template")]
    Template(#[from] tera::Error),
}

/// Steps in execution order
pub struct StepRegistry {
    steps: Vec<Box<dyn Step>>,
}

impl StepRegistry {
    /// Validate `steps` and order them so every step follows its dependencies.
    ///
    /// The sort is stable: among steps whose dependencies are all placed, the
    /// one declared first goes next.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self, PlanError> {
        let mut names = HashSet::new();
        for step in &steps {
            if step.name().is_empty() {
                return Err(PlanError::EmptyName);
            }
            if !names.insert(step.name()) {
                return Err(PlanError::DuplicateStep(step.name().to_string()));
            }
        }

        for step in &steps {
            for dep in step.depends_on() {
                if dep == step.name() {
                    return Err(PlanError::SelfDependency(dep.clone()));
                }
                if !names.contains(dep.as_str()) {
                    return Err(PlanError::UnknownDependency {
                        step: step.name().to_string(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut pending: Vec<Option<Box<dyn Step>>> = steps.into_iter().map(Some).collect();
        let mut placed: HashSet<String> = HashSet::new();
        let mut ordered = Vec::with_capacity(pending.len());

        while ordered.len() < pending.len() {
            let next = pending.iter().position(|slot| {
                slot.as_ref().is_some_and(|step| {
                    step.depends_on().iter().all(|d| placed.contains(d.as_str()))
                })
            });

            let Some(index) = next else {
                let stuck = pending
                    .iter()
                    .flatten()
                    .map(|s| s.name().to_string())
                    .collect();
                return Err(PlanError::Cycle(stuck));
            };

            if let Some(step) = pending[index].take() {
                placed.insert(step.name().to_string());
                ordered.push(step);
            }
        }

        Ok(Self { steps: ordered })
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step names in execution order
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Look up a step by name
    pub fn get(&self, name: &str) -> Option<&dyn Step> {
        self.steps.iter().find(|s| s.name() == name).map(|s| &**s)
    }
}
