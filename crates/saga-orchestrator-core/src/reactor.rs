// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The reactor model and its builder surface.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::{ExecutionContext, ReactorId};
use crate::error::{OrchestratorError, Result};
use crate::middleware::Middleware;
use crate::planner::Plan;
use crate::step::{Step, StepName, StepOptions};
use crate::template::Argument;

/// `state: Pending | Executing | Halted | Failed | Successful`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Pending,
    Executing,
    Halted,
    Failed,
    Successful,
}

/// One entry of the undo stack.
///
/// `args_snapshot` captures the arguments as resolved at run time, so undo
/// doesn't depend on since-purged intermediate results.
#[derive(Clone)]
pub struct UndoEntry {
    pub step: Step,
    pub value: Value,
    pub args_snapshot: Map<String, Value>,
}

/// The reactor aggregate.
pub struct Reactor {
    pub id: ReactorId,
    pub inputs: Vec<String>,
    /// Arena of every step definition known to this reactor, keyed by name.
    /// Dynamically emitted steps that reuse an existing name replace that
    /// entry in place (compose/map self-recursion).
    pub steps: HashMap<StepName, Step>,
    /// Names awaiting their first merge into `plan`.
    pub unplanned: Vec<StepName>,
    pub plan: Plan,
    pub intermediate_results: HashMap<StepName, Value>,
    pub undo_stack: Vec<UndoEntry>,
    pub context: ExecutionContext,
    pub return_step: Option<StepName>,
    pub state: ReactorState,
    pub middleware: Vec<Arc<dyn Middleware>>,
}

impl Reactor {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            inputs: Vec::new(),
            steps: HashMap::new(),
            unplanned: Vec::new(),
            plan: Plan::empty(),
            intermediate_results: HashMap::new(),
            undo_stack: Vec::new(),
            context: ExecutionContext::new(HashMap::new()),
            return_step: None,
            state: ReactorState::Pending,
            middleware: Vec::new(),
        }
    }

    /// Validates the invariants: every `Input` reference
    /// corresponds to a declared input, every `Result` reference corresponds
    /// to a known step, argument names are unique per step, step names are
    /// unique per reactor, and a return step is declared.
    pub fn validate(&self) -> Result<()> {
        let Some(return_step) = &self.return_step else {
            return Err(OrchestratorError::MissingReturn);
        };
        if !self.steps.contains_key(return_step) {
            return Err(OrchestratorError::UnknownStepReference {
                step: "<return>".to_string(),
                reference: return_step.clone(),
            });
        }

        for step in self.steps.values() {
            let mut seen_args = std::collections::HashSet::new();
            for argument in &step.arguments {
                if argument.name != crate::template::DISCARD && !seen_args.insert(&argument.name) {
                    return Err(OrchestratorError::DuplicateArgument {
                        step: step.name.clone(),
                        argument: argument.name.clone(),
                    });
                }
                match &argument.source {
                    crate::template::Template::Input { name } => {
                        if !self.inputs.iter().any(|i| i == name) {
                            return Err(OrchestratorError::MissingInput {
                                step: step.name.clone(),
                                input: name.clone(),
                            });
                        }
                    }
                    crate::template::Template::Result { name, .. } => {
                        if !self.steps.contains_key(name) {
                            return Err(OrchestratorError::UnknownStepReference {
                                step: step.name.clone(),
                                reference: name.clone(),
                            });
                        }
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Injects dynamically emitted (or initially unplanned) steps into the
    /// plan. Steps that reuse an already-planned step's name replace that
    /// vertex's body in place rather than creating a disconnected duplicate.
    pub fn inject(&mut self, new_steps: Vec<Step>) -> Result<()> {
        let lowered = crate::planner::lower_argument_transforms(new_steps);
        for step in &lowered {
            self.steps.insert(step.name.clone(), step.clone());
        }
        self.plan.merge(&lowered)?;
        Ok(())
    }

    /// Drops any stored result no longer referenced by a not-yet-resolved
    /// step's `Result` argument, keeping the return step's own result (it's
    /// consumed once the reactor finishes, not by another step). Undo does
    /// not depend on this map — `UndoEntry::args_snapshot` captures a step's
    /// resolved arguments at run time, so purging here is always safe.
    pub fn purge_unreferenced_results(&mut self) {
        let mut referenced: std::collections::HashSet<&StepName> = std::collections::HashSet::new();
        for name in self.plan.names().chain(self.unplanned.iter()) {
            let Some(step) = self.steps.get(name) else { continue };
            for argument in &step.arguments {
                if let Some(dep) = argument.source.dependency() {
                    referenced.insert(dep);
                }
            }
        }
        let return_step = self.return_step.clone();
        self.intermediate_results
            .retain(|name, _| referenced.contains(name) || Some(name) == return_step.as_ref());
    }

    /// Returns a fresh, not-yet-executed working copy of this reactor's
    /// definition (same `id`, inputs, step bodies, return step, middleware;
    /// reset plan/results/undo stack). Used by the `Compose` primitive to
    /// invoke the same reactor definition repeatedly while keeping `id`
    /// stable for recursion detection.
    pub fn fresh_instance(&self) -> Reactor {
        Reactor {
            id: self.id,
            inputs: self.inputs.clone(),
            steps: self.steps.clone(),
            unplanned: self.steps.keys().cloned().collect(),
            plan: Plan::empty(),
            intermediate_results: HashMap::new(),
            undo_stack: Vec::new(),
            context: ExecutionContext::new(HashMap::new()),
            return_step: self.return_step.clone(),
            state: ReactorState::Pending,
            middleware: self.middleware.clone(),
        }
    }

    /// Builds the initial plan from every step known at construction time.
    pub fn ensure_planned(&mut self) -> Result<()> {
        if self.plan.is_empty() && !self.steps.is_empty() {
            let all: Vec<Step> = self.steps.values().cloned().collect();
            self.steps.clear();
            let lowered = crate::planner::lower_argument_transforms(all);
            for step in &lowered {
                self.steps.insert(step.name.clone(), step.clone());
            }
            self.plan = Plan::build(&lowered)?;
        }
        self.unplanned.clear();
        Ok(())
    }
}

/// `new() -> Reactor`, `add_input`, `add_step`, `compose`, `return`,
/// `add_middleware`.
pub struct ReactorBuilder {
    reactor: Reactor,
}

impl Default for ReactorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReactorBuilder {
    pub fn new() -> Self {
        Self {
            reactor: Reactor::new(),
        }
    }

    pub fn add_input(mut self, name: impl Into<String>) -> Self {
        self.reactor.inputs.push(name.into());
        self
    }

    pub fn add_step(mut self, step: Step) -> Self {
        self.reactor.steps.insert(step.name.clone(), step);
        self
    }

    /// Embeds `inner` as a step of the outer reactor.
    /// The actual inline-vs-runtime-compose decision is made when the step
    /// runs, based on whether `inner`'s id is already on the active
    /// composition chain.
    pub fn compose(
        self,
        name: impl Into<String>,
        inner: Arc<Reactor>,
        arguments: Vec<Argument>,
        options: crate::primitives::compose::ComposeOptions,
    ) -> Self {
        let step = crate::primitives::compose::compose_step(name.into(), inner, arguments, options);
        self.add_step(step)
    }

    pub fn return_step(mut self, name: impl Into<String>) -> Self {
        self.reactor.return_step = Some(name.into());
        self
    }

    pub fn add_middleware(mut self, handler: Arc<dyn Middleware>) -> Self {
        self.reactor.middleware.push(handler);
        self
    }

    pub fn build(self) -> Reactor {
        self.reactor
    }
}

/// `new_step(name, impl, arguments, options) -> Step`, for dynamic
/// emission from a running step.
pub fn new_step(
    name: impl Into<StepName>,
    implementation: Arc<dyn crate::step::StepImpl>,
    arguments: Vec<Argument>,
    options: StepOptions,
) -> Step {
    Step::new(name, implementation)
        .with_arguments(arguments)
        .with_options(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::tests_support::noop_step;

    #[test]
    fn validate_requires_return_step() {
        let reactor = ReactorBuilder::new().add_step(Step::new("a", noop_step())).build();
        assert!(matches!(reactor.validate(), Err(OrchestratorError::MissingReturn)));
    }

    #[test]
    fn validate_flags_unknown_input_reference() {
        use crate::template::{Argument, Template};
        let reactor = ReactorBuilder::new()
            .add_step(
                Step::new("a", noop_step())
                    .with_arguments(vec![Argument::new("x", Template::input("missing"))]),
            )
            .return_step("a")
            .build();
        assert!(matches!(reactor.validate(), Err(OrchestratorError::MissingInput { .. })));
    }

    #[test]
    fn validate_passes_for_well_formed_reactor() {
        let reactor = ReactorBuilder::new()
            .add_input("name")
            .add_step(Step::new("a", noop_step()))
            .return_step("a")
            .build();
        assert!(reactor.validate().is_ok());
    }

    #[test]
    fn purge_drops_results_no_longer_referenced() {
        use crate::template::{Argument, Template};

        let mut reactor = ReactorBuilder::new()
            .add_step(Step::new("a", noop_step()))
            .add_step(Step::new("b", noop_step()).with_arguments(vec![Argument::new("x", Template::result("a"))]))
            .return_step("b")
            .build();
        reactor.ensure_planned().unwrap();

        reactor.intermediate_results.insert("a".to_string(), Value::from(1));
        reactor.plan.remove("a");
        reactor.purge_unreferenced_results();
        assert!(
            reactor.intermediate_results.contains_key("a"),
            "a's result is still referenced by b's pending argument"
        );

        reactor.intermediate_results.insert("b".to_string(), Value::from(2));
        reactor.plan.remove("b");
        reactor.purge_unreferenced_results();
        assert!(!reactor.intermediate_results.contains_key("a"), "b no longer references a");
        assert!(
            reactor.intermediate_results.contains_key("b"),
            "b is the return step, its own result is kept"
        );
    }
}
