// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Plumbing shared by the primitives that invoke a nested reactor
//! (`Compose`'s runtime-composition branch and `Group`).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::executor::{run_with_context, ExecutionOutcome, ExecutorOptions};
use crate::reactor::Reactor;
use crate::step::{RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::{Argument, Template};

/// Reads back the `private.composed_reactors` id set a step's JSON context
/// view exposes.
pub(crate) fn composed_reactors_from_ctx(ctx: &Value) -> HashSet<Uuid> {
    ctx["private"]["composed_reactors"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().and_then(|s| Uuid::parse_str(s).ok()))
                .collect()
        })
        .unwrap_or_default()
}

/// Reads back the shared concurrency pool key from a step's context view, if
/// any.
pub(crate) fn concurrency_key_from_ctx(ctx: &Value) -> Option<Uuid> {
    ctx["private"]["concurrency_key"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
}

/// Caller-supplied overrides for a nested run's [`ExecutorOptions`]; fields
/// left `None` inherit the default the top-level `run` would use.
#[derive(Debug, Clone, Default)]
pub(crate) struct NestedOptions {
    pub timeout: Option<std::time::Duration>,
    pub max_iterations: Option<u64>,
}

/// Runs `inner` as a nested reactor, inheriting the caller's concurrency pool
/// key and composed-reactor recursion set, plus one additional id if the
/// caller is entering a new composition scope.
pub(crate) async fn run_nested(
    inner: Arc<Reactor>,
    inputs: HashMap<String, Value>,
    ctx: &Value,
    extra_composed: Option<Uuid>,
    overrides: NestedOptions,
) -> Result<ExecutionOutcome> {
    let mut composed = composed_reactors_from_ctx(ctx);
    if let Some(id) = extra_composed {
        composed.insert(id);
    }

    let mut exec_ctx = ExecutionContext::new(inputs);
    exec_ctx.private.composed_reactors = composed;

    let mut options = ExecutorOptions::default();
    if let Some(key) = concurrency_key_from_ctx(ctx) {
        options = options.with_concurrency_key(key);
    }
    if let Some(t) = overrides.timeout {
        options = options.with_timeout(t);
    }
    if let Some(m) = overrides.max_iterations {
        options = options.with_max_iterations(m);
    }

    let fresh = inner.fresh_instance();
    run_with_context(fresh, exec_ctx, options).await
}

/// Trivial pass-through step used wherever a dynamically emitted subgraph
/// needs its terminal value to surface under the name of the step that
/// emitted it (`Compose`'s inline branch, `Switch`'s branch emission): naming
/// this step the same as the emitting step makes the executor's
/// self-replacement path treat it as that step still being in flight, so the
/// forwarded value lands in `intermediate_results` under the original name
/// instead of being overwritten with the emitting step's own `Null` value.
struct ForwardStep;

#[async_trait]
impl StepImpl for ForwardStep {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        RunOutcome::Ok(args.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Builds a step named `name` that forwards `Result(from)` as its own value.
pub(crate) fn forward_step(name: StepName, from: StepName) -> Step {
    Step::new(name, Arc::new(ForwardStep)).with_arguments(vec![Argument::new("value", Template::result(from))])
}
