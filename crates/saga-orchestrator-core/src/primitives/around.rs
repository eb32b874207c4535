// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Around: a user-supplied wrapper around a throwaway child
//! reactor built from a fixed list of steps. The callback the wrapper
//! invokes runs those steps to completion and hands back every step's
//! result keyed by name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};

use crate::executor::ExecutionOutcome;
use crate::primitives::shared::{run_nested, NestedOptions};
use crate::reactor::ReactorBuilder;
use crate::step::{RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::{Argument, Template};

/// The engine-provided callback an [`AroundHandler`] invokes to execute the
/// wrapped steps.
#[derive(Clone)]
pub struct AroundCallback {
    steps: Vec<Step>,
    ctx: Value,
}

impl AroundCallback {
    pub fn invoke(&self) -> BoxFuture<'static, std::result::Result<Value, String>> {
        let steps = self.steps.clone();
        let ctx = self.ctx.clone();
        Box::pin(async move { run_throwaway(steps, &ctx).await })
    }
}

async fn run_throwaway(steps: Vec<Step>, ctx: &Value) -> std::result::Result<Value, String> {
    if steps.is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let collect_args: Vec<Argument> = steps
        .iter()
        .map(|s| Argument::new(s.name.clone(), Template::result(s.name.clone())))
        .collect();
    let collector = Step::new("__around_collect", Arc::new(CollectStep)).with_arguments(collect_args);

    let mut builder = ReactorBuilder::new();
    for step in steps {
        builder = builder.add_step(step);
    }
    builder = builder.add_step(collector).return_step("__around_collect");
    let reactor = Arc::new(builder.build());

    match run_nested(reactor, HashMap::new(), ctx, None, NestedOptions::default()).await {
        Ok(ExecutionOutcome::Successful(v)) => Ok(v),
        Ok(ExecutionOutcome::Halted(_)) => Err("around: wrapped steps halted".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

struct CollectStep;

#[async_trait]
impl StepImpl for CollectStep {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        RunOutcome::Ok(Value::Object(args.clone()))
    }
}

/// The user-supplied 4-arity wrapper: `(args, ctx, steps, callback) -> result`.
#[async_trait]
pub trait AroundHandler: Send + Sync {
    async fn wrap(&self, args: Map<String, Value>, ctx: Value, steps: Vec<Step>, callback: AroundCallback) -> std::result::Result<Value, String>;
}

struct AroundStep {
    steps: Vec<Step>,
    handler: Arc<dyn AroundHandler>,
}

#[async_trait]
impl StepImpl for AroundStep {
    async fn run(&self, args: &Map<String, Value>, ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let callback = AroundCallback {
            steps: self.steps.clone(),
            ctx: ctx.clone(),
        };
        match self.handler.wrap(args.clone(), ctx.clone(), self.steps.clone(), callback).await {
            Ok(v) => RunOutcome::Ok(v),
            Err(e) => RunOutcome::Error(e),
        }
    }
}

/// Builds an `Around` step: `handler` wraps execution of `steps`, which run
/// to completion as a throwaway child reactor when the handler invokes its
/// callback.
pub fn around_step(name: impl Into<StepName>, steps: Vec<Step>, arguments: Vec<Argument>, handler: Arc<dyn AroundHandler>) -> Step {
    Step::new(name.into(), Arc::new(AroundStep { steps, handler })).with_arguments(arguments)
}
