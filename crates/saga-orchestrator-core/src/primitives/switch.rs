// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Switch: evaluates a template, dynamically emits the first
//! matching branch's steps (or the default, or errors).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::OrchestratorError;
use crate::primitives::shared::forward_step;
use crate::step::{AsyncPolicy, RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::{Argument, Template};

/// One `{predicate, steps}` branch.
#[derive(Clone)]
pub struct Branch {
    pub predicate: Arc<dyn Fn(&Value) -> bool + Send + Sync>,
    pub steps: Vec<Step>,
}

impl Branch {
    pub fn new(predicate: Arc<dyn Fn(&Value) -> bool + Send + Sync>, steps: Vec<Step>) -> Self {
        Self { predicate, steps }
    }
}

/// `is_nil_or_false` — treats `null` and `false` as the falsy branch condition.
pub fn is_nil_or_false(value: &Value) -> bool {
    matches!(value, Value::Null) || matches!(value, Value::Bool(false))
}

#[derive(Clone)]
pub struct SwitchSpec {
    pub branches: Vec<Branch>,
    pub default: Option<Vec<Step>>,
    /// `allow_async? = false` forces every emitted step to run synchronously.
    pub allow_async: bool,
}

struct SwitchStep {
    name: StepName,
    spec: SwitchSpec,
}

#[async_trait]
impl StepImpl for SwitchStep {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let value = args.get("on").cloned().unwrap_or(Value::Null);

        for branch in &self.spec.branches {
            if (branch.predicate)(&value) {
                return self.emit(branch.steps.clone());
            }
        }

        match &self.spec.default {
            Some(steps) => self.emit(steps.clone()),
            None => RunOutcome::Error(OrchestratorError::NoDefaultBranch { step: self.name.clone() }.to_string()),
        }
    }
}

impl SwitchStep {
    /// Emits the chosen branch's steps, appending a synthetic step named
    /// after this switch step that forwards the branch's last step's result —
    /// so a switch used as (or depended on as) a reactor's return step
    /// resolves to the branch's actual output rather than this step's own
    /// placeholder `Null`.
    fn emit(&self, mut steps: Vec<Step>) -> RunOutcome {
        if !self.spec.allow_async {
            for step in steps.iter_mut() {
                step.async_policy = AsyncPolicy::Fixed(false);
            }
        }
        if let Some(last) = steps.last() {
            let mut forward = forward_step(self.name.clone(), last.name.clone());
            if !self.spec.allow_async {
                forward.async_policy = AsyncPolicy::Fixed(false);
            }
            steps.push(forward);
        }
        RunOutcome::OkEmit(Value::Null, steps)
    }
}

/// Builds a `Switch` step: resolves `on`, then emits the first matching
/// branch's steps, falling back to the default branch.
pub fn switch_step(name: impl Into<StepName>, on: Template, spec: SwitchSpec) -> Step {
    let name = name.into();
    Step::new(name.clone(), Arc::new(SwitchStep { name, spec })).with_arguments(vec![Argument::new("on", on)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{run, ExecutionOutcome, ExecutorOptions};
    use crate::reactor::ReactorBuilder;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStep(Arc<AtomicU32>, Value);
    #[async_trait]
    impl StepImpl for CountingStep {
        async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            RunOutcome::Ok(self.1.clone())
        }
    }

    #[tokio::test]
    async fn falsy_branch_runs_when_predicate_matches() {
        let moo_calls = Arc::new(AtomicU32::new(0));
        let boo_calls = Arc::new(AtomicU32::new(0));
        let falsy_calls = Arc::new(AtomicU32::new(0));

        let spec = SwitchSpec {
            branches: vec![Branch::new(
                Arc::new(is_nil_or_false),
                vec![Step::new("falsy", Arc::new(CountingStep(falsy_calls.clone(), Value::from("falsy"))))],
            )],
            default: Some(vec![Step::new(
                "truthy",
                Arc::new(CountingStep(Arc::new(AtomicU32::new(0)), Value::from("truthy"))),
            )]),
            allow_async: true,
        };

        let reactor = ReactorBuilder::new()
            .add_input("flag")
            .add_step(Step::new("moo", Arc::new(CountingStep(moo_calls.clone(), Value::from("moo")))))
            .add_step(
                Step::new("boo", Arc::new(CountingStep(boo_calls.clone(), Value::Bool(false))))
                    .with_arguments(vec![Argument::discard(Template::result("moo"))]),
            )
            .add_step(switch_step("switch", Template::result("boo"), spec))
            .return_step("switch")
            .build();

        let mut inputs = HashMap::new();
        inputs.insert("flag".to_string(), Value::Bool(true));

        let outcome = run(reactor, inputs, ExecutorOptions::default()).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Successful(_)));
        assert_eq!(moo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(boo_calls.load(Ordering::SeqCst), 1);
        assert_eq!(falsy_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_default_and_no_match_errors() {
        let spec = SwitchSpec {
            branches: vec![Branch::new(Arc::new(|_v: &Value| false), vec![])],
            default: None,
            allow_async: true,
        };
        let reactor = ReactorBuilder::new()
            .add_step(switch_step("switch", Template::value(Value::from(1)), spec))
            .return_step("switch")
            .build();

        let err = run(reactor, HashMap::new(), ExecutorOptions::default()).await;
        assert!(err.is_err());
    }
}
