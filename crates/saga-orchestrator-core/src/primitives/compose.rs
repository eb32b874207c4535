// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Compose: embeds one reactor as a step of another.
//!
//! Two branches, decided at run time from the current composition chain
//! carried in context:
//!
//! - **Inline** (default): the inner reactor's steps are rewritten into the
//!   outer plan directly — no nested `run`, no extra concurrency-pool
//!   bookkeeping.
//! - **Runtime** (the inner reactor's id is already on the chain, i.e. this
//!   is a recursive composition): a single step invokes the inner reactor
//!   via a nested `run` sharing the outer concurrency key, instead of
//!   inlining an unbounded number of copies of itself.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::OrchestratorError;
use crate::executor::ExecutionOutcome;
use crate::primitives::shared::{forward_step, run_nested, NestedOptions};
use crate::reactor::Reactor;
use crate::step::{RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::{Argument, Template};

/// Per-composition overrides (the executor's recognized options apply equally to a
/// nested run). Empty fields inherit the executor's defaults.
#[derive(Debug, Clone, Default)]
pub struct ComposeOptions {
    pub timeout: Option<Duration>,
    pub max_iterations: Option<u64>,
}

fn rewrite_name(outer: &str, inner: &str) -> StepName {
    format!("__compose::{outer}::{inner}")
}

fn validate_arguments(outer_step: &StepName, inner: &Reactor, args: &Map<String, Value>) -> Result<(), OrchestratorError> {
    let missing: Vec<String> = inner.inputs.iter().filter(|n| !args.contains_key(*n)).cloned().collect();
    if !missing.is_empty() {
        return Err(OrchestratorError::ComposeMissingArguments {
            step: outer_step.clone(),
            missing,
        });
    }
    let extra: Vec<String> = args
        .keys()
        .filter(|k| !inner.inputs.iter().any(|i| i == *k))
        .cloned()
        .collect();
    if !extra.is_empty() {
        return Err(OrchestratorError::ComposeExtraArguments {
            step: outer_step.clone(),
            extra,
        });
    }
    Ok(())
}

/// Rewrites `inner`'s steps into the outer namespace, terminating in a synthetic step named `outer_name` that
/// forwards the inner return value — letting the usual self-replacement
/// handling in the executor treat this exactly like any other dynamically
/// emitted step set that replaces the step which emitted it.
fn inline_steps(outer_name: &StepName, inner: &Reactor, args: &Map<String, Value>) -> Result<Vec<Step>, OrchestratorError> {
    let Some(return_name) = &inner.return_step else {
        return Err(OrchestratorError::ComposeNoReturn { step: outer_name.clone() });
    };

    let mut rewritten = Vec::with_capacity(inner.steps.len() + 1);
    for step in inner.steps.values() {
        let new_name = rewrite_name(outer_name, &step.name);
        let mut new_step = step.clone();
        if new_step.step_ref == step.name {
            new_step.step_ref = new_name.clone();
        }
        new_step.name = new_name;

        for argument in new_step.arguments.iter_mut() {
            match &argument.source {
                Template::Input { name } => {
                    let value = args.get(name).cloned().unwrap_or(Value::Null);
                    argument.source = Template::Value { value };
                }
                Template::Result { name, sub_path } => {
                    argument.source = Template::Result {
                        name: rewrite_name(outer_name, name),
                        sub_path: sub_path.clone(),
                    };
                }
                Template::Value { .. } | Template::Element { .. } => {}
            }
        }
        rewritten.push(new_step);
    }

    rewritten.push(forward_step(outer_name.clone(), rewrite_name(outer_name, return_name)));
    Ok(rewritten)
}

struct ComposeStep {
    outer_name: StepName,
    inner: Arc<Reactor>,
    options: ComposeOptions,
}

#[async_trait]
impl StepImpl for ComposeStep {
    async fn run(&self, args: &Map<String, Value>, ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        if let Err(e) = validate_arguments(&self.outer_name, &self.inner, args) {
            return RunOutcome::Error(e.to_string());
        }

        let composed = crate::primitives::shared::composed_reactors_from_ctx(ctx);
        if composed.contains(&self.inner.id) {
            self.run_runtime(args, ctx).await
        } else {
            match inline_steps(&self.outer_name, &self.inner, args) {
                Ok(steps) => RunOutcome::OkEmit(Value::Null, steps),
                Err(e) => RunOutcome::Error(e.to_string()),
            }
        }
    }
}

impl ComposeStep {
    async fn run_runtime(&self, args: &Map<String, Value>, ctx: &Value) -> RunOutcome {
        let mut inputs: HashMap<String, Value> = HashMap::new();
        for name in &self.inner.inputs {
            if let Some(v) = args.get(name) {
                inputs.insert(name.clone(), v.clone());
            }
        }

        let overrides = NestedOptions {
            timeout: self.options.timeout,
            max_iterations: self.options.max_iterations,
        };

        match run_nested(self.inner.clone(), inputs, ctx, Some(self.inner.id), overrides).await {
            Ok(ExecutionOutcome::Successful(v)) => RunOutcome::Ok(v),
            Ok(ExecutionOutcome::Halted(_)) => {
                // A nested halt can't be represented by `RunOutcome::Halt`
                // (which carries only a value, not a resumable reactor) —
                // the whole composition halts too, losing the inner
                // reactor's resumability. See DESIGN.md open questions.
                RunOutcome::Halt(Value::Null)
            }
            Err(e) => RunOutcome::Error(e.to_string()),
        }
    }
}

/// Builds the step a [`crate::reactor::ReactorBuilder::compose`] call
/// produces.
pub fn compose_step(name: StepName, inner: Arc<Reactor>, arguments: Vec<Argument>, options: ComposeOptions) -> Step {
    Step::new(
        name.clone(),
        Arc::new(ComposeStep {
            outer_name: name,
            inner,
            options,
        }),
    )
    .with_arguments(arguments)
}
