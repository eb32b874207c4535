// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Group: a `before_all` hook, a nested reactor run sharing the
//! outer concurrency key, then an `after_all` hook over the result.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::executor::ExecutionOutcome;
use crate::primitives::shared::{run_nested, NestedOptions};
use crate::reactor::Reactor;
use crate::step::{RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::Argument;

/// `before_all(args, ctx) -> (args', ctx')`; may reject with an error.
pub type BeforeAllHook = Arc<dyn Fn(Map<String, Value>, Value) -> std::result::Result<(Map<String, Value>, Value), String> + Send + Sync>;

/// `after_all(result) -> result'`.
pub type AfterAllHook = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Clone, Default)]
pub struct GroupOptions {
    pub before_all: Option<BeforeAllHook>,
    pub after_all: Option<AfterAllHook>,
}

struct GroupStep {
    inner: Arc<Reactor>,
    options: GroupOptions,
}

#[async_trait]
impl StepImpl for GroupStep {
    async fn run(&self, args: &Map<String, Value>, ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let (args, ctx) = match &self.options.before_all {
            Some(hook) => match hook(args.clone(), ctx.clone()) {
                Ok(pair) => pair,
                Err(e) => return RunOutcome::Error(e),
            },
            None => (args.clone(), ctx.clone()),
        };

        let mut inputs: HashMap<String, Value> = HashMap::new();
        for name in &self.inner.inputs {
            if let Some(v) = args.get(name) {
                inputs.insert(name.clone(), v.clone());
            }
        }

        let outcome = run_nested(self.inner.clone(), inputs, &ctx, None, NestedOptions::default()).await;
        let value = match outcome {
            Ok(ExecutionOutcome::Successful(v)) => v,
            Ok(ExecutionOutcome::Halted(_)) => return RunOutcome::Halt(Value::Null),
            Err(e) => return RunOutcome::Error(e.to_string()),
        };

        match &self.options.after_all {
            Some(hook) => match hook(value) {
                Ok(v) => RunOutcome::Ok(v),
                Err(e) => RunOutcome::Error(e),
            },
            None => RunOutcome::Ok(value),
        }
    }
}

/// Builds a `Group` step: runs `inner` as a nested reactor, wrapped by the
/// `before_all`/`after_all` hooks in `options`.
pub fn group_step(name: impl Into<StepName>, inner: Arc<Reactor>, arguments: Vec<Argument>, options: GroupOptions) -> Step {
    Step::new(name.into(), Arc::new(GroupStep { inner, options })).with_arguments(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{run, ExecutorOptions};
    use crate::reactor::ReactorBuilder;
    use crate::step::Step;
    use crate::template::Template;

    struct Echo;
    #[async_trait::async_trait]
    impl StepImpl for Echo {
        async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
            RunOutcome::Ok(args.get("n").cloned().unwrap_or(Value::Null))
        }
    }

    fn inner_reactor() -> Reactor {
        ReactorBuilder::new()
            .add_input("n")
            .add_step(Step::new("echo", Arc::new(Echo)).with_arguments(vec![Argument::new("n", Template::input("n"))]))
            .return_step("echo")
            .build()
    }

    #[tokio::test]
    async fn group_runs_inner_reactor_and_applies_after_all() {
        let inner = Arc::new(inner_reactor());
        let options = GroupOptions {
            before_all: None,
            after_all: Some(Arc::new(|v| Ok(serde_json::json!({"wrapped": v})))),
        };
        let outer = ReactorBuilder::new()
            .add_input("seed")
            .add_step(group_step("grouped", inner, vec![Argument::new("n", Template::input("seed"))], options))
            .return_step("grouped")
            .build();

        let mut inputs = HashMap::new();
        inputs.insert("seed".to_string(), Value::from(5));

        let outcome = run(outer, inputs, ExecutorOptions::default()).await.unwrap();
        match outcome {
            ExecutionOutcome::Successful(v) => assert_eq!(v, serde_json::json!({"wrapped": 5})),
            ExecutionOutcome::Halted(_) => panic!("expected success"),
        }
    }

    #[tokio::test]
    async fn before_all_rejection_surfaces_as_step_error() {
        let inner = Arc::new(inner_reactor());
        let options = GroupOptions {
            before_all: Some(Arc::new(|_args, _ctx| Err("rejected".to_string()))),
            after_all: None,
        };
        let outer = ReactorBuilder::new()
            .add_step(group_step("grouped", inner, vec![], options))
            .return_step("grouped")
            .build();

        let err = run(outer, HashMap::new(), ExecutorOptions::default()).await;
        assert!(err.is_err());
    }
}
