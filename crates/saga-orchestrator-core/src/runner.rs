// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The step runner: argument resolution, context assembly, and
//! guard evaluation for one selected step. Invocation and outcome
//! interpretation live in `executor.rs`, which owns the driver loop this
//! feeds.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::planner::apply_whole_transform;
use crate::reactor::Reactor;
use crate::step::{GuardOutcome, Step};
use crate::template::{resolve_template, ResolutionScope, DISCARD};

/// The materialized `(args, ctx)` pair a step body receives.
pub struct Invocation {
    pub args: Map<String, Value>,
    pub ctx_view: Value,
}

/// Resolves `step`'s arguments, applies its whole-arguments transform (if
/// any), merges `context_patch` and `current_step` into the reactor's
/// (persisted, shared) context, and produces the JSON view a [`crate::step::StepImpl`]
/// receives.
pub fn prepare(reactor: &mut Reactor, step: &Step) -> Result<Invocation> {
    let no_elements: HashMap<String, Value> = HashMap::new();
    let scope = ResolutionScope {
        inputs: &reactor.context.private.inputs,
        intermediate_results: &reactor.intermediate_results,
        elements: &no_elements,
        step: &step.name,
    };

    let mut args = Map::new();
    for argument in &step.arguments {
        let value = resolve_template(&argument.source, &scope)?;
        if argument.name != DISCARD {
            args.insert(argument.name.clone(), value);
        }
    }

    let args = apply_whole_transform(step, args)?;

    reactor.context.merge_patch(&step.context_patch);
    reactor.context.private.current_step = Some(step.name.clone());
    let ctx_view = reactor.context.to_step_view();

    Ok(Invocation { args, ctx_view })
}

/// Evaluates `step`'s guards in order against a prepared invocation; a
/// guard may short-circuit with a substitute result or skip.
pub fn evaluate_guards(step: &Step, invocation: &Invocation) -> GuardOutcome {
    for guard in &step.guards {
        match guard(&invocation.args, &invocation.ctx_view) {
            GuardOutcome::Proceed => continue,
            other => return other,
        }
    }
    GuardOutcome::Proceed
}
