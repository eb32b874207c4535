// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The step contract and the `Step` record.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::template::{Argument, Transform};

/// Step names are unique within one reactor.
pub type StepName = String;

/// Identity token stable across retries; used as the retry-counter key.
/// Defaults to the step's name but can be a fresh, name-independent token
/// for dynamically emitted steps.
pub type StepRef = String;

/// `max_retries: nonnegative integer or ∞`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxRetries {
    Count(u32),
    Infinite,
}

impl MaxRetries {
    pub fn allows(self, attempt: u32) -> bool {
        match self {
            MaxRetries::Count(max) => attempt <= max,
            MaxRetries::Infinite => true,
        }
    }
}

impl Default for MaxRetries {
    fn default() -> Self {
        MaxRetries::Count(0)
    }
}

/// `async?: boolean or predicate over options`.
#[derive(Clone)]
pub enum AsyncPolicy {
    Fixed(bool),
    Predicate(Arc<dyn Fn(&StepOptions) -> bool + Send + Sync>),
}

impl AsyncPolicy {
    pub fn evaluate(&self, opts: &StepOptions) -> bool {
        match self {
            AsyncPolicy::Fixed(b) => *b,
            AsyncPolicy::Predicate(p) => p(opts),
        }
    }
}

impl Default for AsyncPolicy {
    fn default() -> Self {
        AsyncPolicy::Fixed(false)
    }
}

impl fmt::Debug for AsyncPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncPolicy::Fixed(b) => write!(f, "AsyncPolicy::Fixed({b})"),
            AsyncPolicy::Predicate(_) => write!(f, "AsyncPolicy::Predicate(..)"),
        }
    }
}

/// Outcome of a guard predicate evaluated before invocation: a guard may
/// short-circuit with a substitute result or skip.
pub enum GuardOutcome {
    Proceed,
    Substitute(Value),
    Skip,
}

pub type Guard = Arc<dyn Fn(&Map<String, Value>, &Value) -> GuardOutcome + Send + Sync>;

/// Whole-arguments transform: fans in all resolved arguments and produces the
/// final arguments map the step receives.
pub type ArgsTransform =
    Arc<dyn Fn(Map<String, Value>) -> std::result::Result<Map<String, Value>, String> + Send + Sync>;

/// Opaque, impl-owned option bag.
#[derive(Clone)]
pub struct StepOptions(Arc<dyn Any + Send + Sync>);

impl StepOptions {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        StepOptions(Arc::new(value))
    }

    pub fn none() -> Self {
        StepOptions(Arc::new(()))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl fmt::Debug for StepOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StepOptions(..)")
    }
}

impl Default for StepOptions {
    fn default() -> Self {
        Self::none()
    }
}

/// A simple string reason carried by a variant that needs an opaque
/// explanation but nothing more structured.
pub type Reason = String;

/// `run(args, ctx, opts) -> RunOutcome`.
#[derive(Debug)]
pub enum RunOutcome {
    /// Success.
    Ok(Value),
    /// Success with additional steps to inject into the plan.
    OkEmit(Value, Vec<Step>),
    /// Failure; triggers compensation.
    Error(Reason),
    /// Re-enqueue (respecting `max_retries`), no reason given.
    Retry,
    /// Re-enqueue with a reason (for events/logging).
    RetryWith(Reason),
    /// Stash partial state and transition to Halted.
    Halt(Value),
}

/// `compensate(error, args, ctx, opts) -> CompensationOutcome`.
#[derive(Debug)]
pub enum CompensationOutcome {
    /// Proceed with rollback.
    Ok,
    /// Substitute `value` as if the step had succeeded.
    Continue(Value),
    /// Re-attempt `run` (counts toward `max_retries`).
    Retry,
    RetryWith(Reason),
    /// Replace the error before rollback.
    Error(Reason),
}

/// `undo(value, args, ctx, opts) -> UndoOutcome`.
#[derive(Debug)]
pub enum UndoOutcome {
    Ok,
    Retry,
    Error(Reason),
}

/// The step-implementation contract. Every step implementation
/// is opaque to the engine except through this trait's four operations.
#[async_trait]
pub trait StepImpl: Send + Sync {
    async fn run(&self, args: &Map<String, Value>, ctx: &Value, opts: &StepOptions) -> RunOutcome;

    async fn compensate(
        &self,
        _error: &Reason,
        _args: &Map<String, Value>,
        _ctx: &Value,
        _opts: &StepOptions,
    ) -> CompensationOutcome {
        CompensationOutcome::Ok
    }

    async fn undo(
        &self,
        _value: &Value,
        _args: &Map<String, Value>,
        _ctx: &Value,
        _opts: &StepOptions,
    ) -> UndoOutcome {
        UndoOutcome::Ok
    }

    async fn backoff(&self, _attempt: u32, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> Option<std::time::Duration> {
        None
    }

    /// Whether this implementation overrides `undo` with real rollback
    /// behavior. The default `undo` is a no-op, and a step with no undo
    /// implementation must never contribute to the undo stack —
    /// implementations that do define one must say so here.
    fn is_undoable(&self) -> bool {
        false
    }
}

/// A step. Opaque to the engine except for these fields.
#[derive(Clone)]
pub struct Step {
    pub name: StepName,
    pub implementation: Arc<dyn StepImpl>,
    pub options: StepOptions,
    pub arguments: Vec<Argument>,
    pub async_policy: AsyncPolicy,
    pub max_retries: MaxRetries,
    pub context_patch: Map<String, Value>,
    pub step_ref: StepRef,
    pub guards: Vec<Guard>,
    pub transform: Option<ArgsTransform>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("arguments", &self.arguments)
            .field("async_policy", &self.async_policy)
            .field("max_retries", &self.max_retries)
            .field("step_ref", &self.step_ref)
            .finish()
    }
}

impl Step {
    pub fn new(name: impl Into<StepName>, implementation: Arc<dyn StepImpl>) -> Self {
        let name = name.into();
        Self {
            step_ref: name.clone(),
            name,
            implementation,
            options: StepOptions::none(),
            arguments: Vec::new(),
            async_policy: AsyncPolicy::default(),
            max_retries: MaxRetries::default(),
            context_patch: Map::new(),
            guards: Vec::new(),
            transform: None,
        }
    }

    pub fn with_options(mut self, options: StepOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<Argument>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_async(mut self, policy: AsyncPolicy) -> Self {
        self.async_policy = policy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: MaxRetries) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_context_patch(mut self, patch: Map<String, Value>) -> Self {
        self.context_patch = patch;
        self
    }

    /// Gives the step a fresh, name-independent retry-counter identity
    /// instead of the default (its own name) — used for dynamically
    /// emitted steps that share a name template.
    pub fn with_fresh_ref(mut self) -> Self {
        self.step_ref = uuid::Uuid::new_v4().to_string();
        self
    }

    pub fn with_guards(mut self, guards: Vec<Guard>) -> Self {
        self.guards = guards;
        self
    }

    pub fn with_transform(mut self, transform: ArgsTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn is_undoable(&self) -> bool {
        self.implementation.is_undoable()
    }
}

/// A trivial [`StepImpl`] used internally for synthetic per-argument
/// transform steps — non-undoable, zero retries, pure function
/// of its single resolved input.
pub struct InlineTransformStep {
    pub transform: Transform,
}

#[async_trait]
impl StepImpl for InlineTransformStep {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let input = args.get("value").cloned().unwrap_or(Value::Null);
        match (self.transform)(input) {
            Ok(v) => RunOutcome::Ok(v),
            Err(e) => RunOutcome::Error(e),
        }
    }
}
