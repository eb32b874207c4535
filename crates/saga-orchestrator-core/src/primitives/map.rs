// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Map/Iterator: a self-recursive step driving an
//! `Initialise -> Generating -> Finalising` state machine, emitting
//! per-element subgraphs as it goes. Recursion is heap-scheduled through the
//! normal planner reinjection path — each phase transition bakes its
//! state directly into the next emitted step's arguments as embedded
//! `Value`s, rather than reading it back via a `Result` self-reference,
//! since this engine doesn't retain a self-replaced step's own prior result.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::OrchestratorError;
use crate::step::{RunOutcome, Step, StepImpl, StepName, StepOptions};
use crate::template::{Argument, Template};

/// `initialiser(args, ctx) -> {ok, state} | err`.
pub type Initialiser = Arc<dyn Fn(&Map<String, Value>, &Value) -> std::result::Result<Value, String> + Send + Sync>;

/// `generator(state, ctx) -> {cont, elements, new_state} | {halt, state} | {error, r}`.
pub enum GeneratorOutcome {
    Continue(Vec<Value>, Value),
    Halt(Value),
    Error(String),
}

pub type Generator = Arc<dyn Fn(&Value, &Value, usize) -> GeneratorOutcome + Send + Sync>;

/// `finaliser(state, ctx) -> result | err`.
pub type Finaliser = Arc<dyn Fn(&Value, &Value) -> std::result::Result<Value, String> + Send + Sync>;

#[derive(Clone)]
pub struct MapSpec {
    pub initialiser: Initialiser,
    pub generator: Generator,
    pub finaliser: Finaliser,
    /// The per-element step subgraph template; `Element{scope_name}`
    /// templates inside these steps resolve to the current batch element.
    pub element_steps: Vec<Step>,
    pub scope_name: String,
    /// How many elements the generator returns per call.
    pub batch_size: usize,
}

const PHASE_INITIALISE: &str = "initialise";
const PHASE_GENERATING: &str = "generating";
const PHASE_FINALISING: &str = "finalising";

struct MapStep {
    name: StepName,
    spec: MapSpec,
}

#[async_trait]
impl StepImpl for MapStep {
    async fn run(&self, args: &Map<String, Value>, ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let phase = args.get("phase").and_then(Value::as_str).unwrap_or(PHASE_INITIALISE).to_string();
        let next_index = args.get("next_index").and_then(Value::as_u64).unwrap_or(0) as usize;

        match phase.as_str() {
            PHASE_INITIALISE => match (self.spec.initialiser)(args, ctx) {
                Ok(state) => RunOutcome::OkEmit(Value::Null, vec![self.recursive_step(PHASE_GENERATING, state, next_index)]),
                Err(e) => RunOutcome::Error(e),
            },
            PHASE_GENERATING => {
                let state = args.get("state").cloned().unwrap_or(Value::Null);
                match (self.spec.generator)(&state, ctx, self.spec.batch_size) {
                    GeneratorOutcome::Continue(elements, new_state) => {
                        let mut emitted = Vec::with_capacity(elements.len() * self.spec.element_steps.len() + 1);
                        let mut index = next_index;
                        for element in elements {
                            emitted.extend(self.instantiate_element_steps(index, element));
                            index += 1;
                        }
                        emitted.push(self.recursive_step(PHASE_GENERATING, new_state, index));
                        RunOutcome::OkEmit(Value::Null, emitted)
                    }
                    GeneratorOutcome::Halt(state) => {
                        RunOutcome::OkEmit(Value::Null, vec![self.recursive_step(PHASE_FINALISING, state, next_index)])
                    }
                    GeneratorOutcome::Error(e) => RunOutcome::Error(e),
                }
            }
            PHASE_FINALISING => {
                let state = args.get("state").cloned().unwrap_or(Value::Null);
                match (self.spec.finaliser)(&state, ctx) {
                    Ok(_) => RunOutcome::Ok(Value::String("ok".to_string())),
                    Err(e) => RunOutcome::Error(e),
                }
            }
            _ => RunOutcome::Error(OrchestratorError::InvalidIteratorState { step: self.name.clone() }.to_string()),
        }
    }
}

impl MapStep {
    /// The self-recursive step that advances to `phase`.
    fn recursive_step(&self, phase: &str, state: Value, next_index: usize) -> Step {
        Step::new(
            self.name.clone(),
            Arc::new(MapStep {
                name: self.name.clone(),
                spec: self.spec.clone(),
            }),
        )
        .with_arguments(vec![
            Argument::new("phase", Template::value(Value::String(phase.to_string()))),
            Argument::new("state", Template::value(state)),
            Argument::new("next_index", Template::value(Value::from(next_index as u64))),
        ])
    }

    /// Instantiates one copy of the element step template for `element` at
    /// batch position `idx`, renaming the steps and their mutual `Result`
    /// dependencies into a scope unique to this element.
    fn instantiate_element_steps(&self, idx: usize, element: Value) -> Vec<Step> {
        let local_names: HashSet<&str> = self.spec.element_steps.iter().map(|s| s.name.as_str()).collect();

        self.spec
            .element_steps
            .iter()
            .map(|template| {
                let new_name = format!("{}::{idx}::{}", self.name, template.name);
                let mut step = template.clone();
                if step.step_ref == template.name {
                    step.step_ref = new_name.clone();
                }
                step.name = new_name;

                for argument in step.arguments.iter_mut() {
                    match &argument.source {
                        Template::Element { name } if *name == self.spec.scope_name => {
                            argument.source = Template::Value { value: element.clone() };
                        }
                        Template::Result { name, sub_path } if local_names.contains(name.as_str()) => {
                            argument.source = Template::Result {
                                name: format!("{}::{idx}::{name}", self.name),
                                sub_path: sub_path.clone(),
                            };
                        }
                        _ => {}
                    }
                }
                step
            })
            .collect()
    }
}

/// Builds a `Map`/`Iterator` step.
pub fn map_step(name: impl Into<StepName>, spec: MapSpec) -> Step {
    let name = name.into();
    Step::new(name.clone(), Arc::new(MapStep { name, spec }))
}
