// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the saga orchestrator.

use std::time::Duration;

use crate::step::StepName;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A single unrecoverable cause surfaced by the engine.
///
/// Classes: *Invalid* (user-facing), *Validation*, *Internal*, and *Unknown*.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    // ---- Invalid (user-facing) ----------------------------------------
    #[error("step '{step}' references unknown input '{input}'")]
    MissingInput { step: StepName, input: String },

    #[error("step '{step}' references result of unresolved/unknown step '{result_of}'")]
    MissingResult { step: StepName, result_of: StepName },

    #[error("step '{step}' is missing required argument '{argument}'")]
    MissingArgument { step: StepName, argument: String },

    #[error("step '{step}' sub-path {path:?} on result of '{result_of}' could not be resolved")]
    ArgumentSubpath {
        step: StepName,
        result_of: StepName,
        path: Vec<String>,
    },

    #[error("step '{step}' run failed: {cause}")]
    RunStepError { step: StepName, cause: String },

    #[error("step '{step}' compensate failed: {cause}")]
    CompensateStepError { step: StepName, cause: String },

    #[error("step '{step}' undo failed: {cause}")]
    UndoStepError { step: StepName, cause: String },

    #[error("step '{step}' exceeded max_retries ({retry_count})")]
    RetriesExceeded { step: StepName, retry_count: u32 },

    #[error("step '{step}' exceeded undo retries ({retry_count})")]
    UndoRetriesExceeded { step: StepName, retry_count: u32 },

    #[error("step '{step}' failed deliberately")]
    ForcedFailure { step: StepName },

    #[error("compose step '{step}' is missing arguments: {missing:?}")]
    ComposeMissingArguments { step: StepName, missing: Vec<String> },

    #[error("compose step '{step}' supplied unknown arguments: {extra:?}")]
    ComposeExtraArguments { step: StepName, extra: Vec<String> },

    #[error("compose step '{step}' inner reactor declared no return step")]
    ComposeNoReturn { step: StepName },

    #[error("transform for '{input}' failed: {cause}")]
    TransformError {
        input: String,
        output: Option<String>,
        cause: String,
    },

    #[error("switch step '{step}' matched no branch and declared no default")]
    NoDefaultBranch { step: StepName },

    // ---- Validation -----------------------------------------------------
    #[error("reactor declares no return step")]
    MissingReturn,

    #[error("dependency cycle detected: {cycle:?}")]
    PlanError { cycle: Vec<StepName> },

    #[error("step '{step}' depends on unknown step '{reference}'")]
    UnknownStepReference { step: StepName, reference: StepName },

    #[error("step '{name}' is declared more than once")]
    DuplicateStep { name: StepName },

    #[error("argument '{argument}' is declared more than once on step '{step}'")]
    DuplicateArgument { step: StepName, argument: String },

    // ---- Internal (engine bugs) ------------------------------------------
    #[error("internal: iterator step '{step}' entered an invalid state")]
    InvalidIteratorState { step: StepName },

    #[error("internal: plan is non-empty but no step is ready and none is running")]
    Stuck,

    #[error("internal: executor timed out after {elapsed:?} while halting")]
    HaltTimeout { elapsed: Duration },

    // ---- Unknown ----------------------------------------------------------
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl OrchestratorError {
    /// Wraps an arbitrary cause that doesn't fit a named variant.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Unknown(msg.into())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unknown(err.to_string())
    }
}

/// The final outcome of a rollback: every undo attempt's error, in the order
/// encountered while unwinding the undo stack — undo errors never
/// short-circuit the unwind.
#[derive(Debug, thiserror::Error)]
#[error("saga failed with {} error(s): {}", .0.len(), summarize(.0))]
pub struct SagaFailure(pub Vec<OrchestratorError>);

fn summarize(errors: &[OrchestratorError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<SagaFailure> for OrchestratorError {
    fn from(failure: SagaFailure) -> Self {
        if failure.0.len() == 1 {
            // Single-error reactors present a single error.
            match failure.0.into_iter().next() {
                Some(e) => e,
                None => OrchestratorError::Unknown("empty saga failure".into()),
            }
        } else {
            OrchestratorError::Unknown(failure.to_string())
        }
    }
}
