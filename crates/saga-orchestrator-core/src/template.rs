// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Templates & Arguments.
//!
//! A [`Template`] is an abstract reference to a runtime value. Resolving one
//! against a materialized [`ResolutionScope`] is the only place the engine
//! reads user data before handing it to a step implementation.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::step::StepName;

/// A reference to a value source.
#[derive(Debug, Clone)]
pub enum Template {
    /// A reactor-level input by name.
    Input { name: String },
    /// The result of another step, optionally navigated via `sub_path`.
    Result { name: StepName, sub_path: Vec<String> },
    /// An embedded static value.
    Value { value: Value },
    /// The current element of an enclosing map/iterator scope.
    Element { name: String },
}

impl Template {
    pub fn input(name: impl Into<String>) -> Self {
        Template::Input { name: name.into() }
    }

    pub fn result(name: impl Into<StepName>) -> Self {
        Template::Result {
            name: name.into(),
            sub_path: Vec::new(),
        }
    }

    pub fn result_path(name: impl Into<StepName>, sub_path: Vec<String>) -> Self {
        Template::Result {
            name: name.into(),
            sub_path,
        }
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Template::Value { value: value.into() }
    }

    pub fn element(name: impl Into<String>) -> Self {
        Template::Element { name: name.into() }
    }

    /// The step name this template depends on, if any (used by the planner
    /// to derive dependency edges).
    pub fn dependency(&self) -> Option<&StepName> {
        match self {
            Template::Result { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A single synchronous value transform applied after template resolution.
///
/// Modeled as a boxed closure rather than a trait object with associated
/// methods, since user step bodies are opaque to the engine: it only needs
/// to *call* the transform, never introspect it.
pub type Transform = Arc<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// A named input to a step, sourced from a [`Template`].
#[derive(Clone)]
pub struct Argument {
    pub name: String,
    pub source: Template,
    pub transform: Option<Transform>,
}

impl std::fmt::Debug for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Argument")
            .field("name", &self.name)
            .field("source", &self.source)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

/// The special argument name meaning "satisfy the dependency, don't pass it".
pub const DISCARD: &str = "_";

impl Argument {
    pub fn new(name: impl Into<String>, source: Template) -> Self {
        Self {
            name: name.into(),
            source,
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Dependency discard marker.
    pub fn discard(source: Template) -> Self {
        Self::new(DISCARD, source)
    }
}

/// Everything needed to resolve [`Template`]s for one step invocation,
/// including element scoping for map/iterator steps.
pub struct ResolutionScope<'a> {
    pub inputs: &'a HashMap<String, Value>,
    pub intermediate_results: &'a HashMap<StepName, Value>,
    /// Current element bindings of enclosing map/iterator scopes, keyed by
    /// the scope name the `Element` template references.
    pub elements: &'a HashMap<String, Value>,
    pub step: &'a StepName,
}

/// Resolves a single [`Template`] to a concrete [`Value`].
pub fn resolve_template(template: &Template, scope: &ResolutionScope<'_>) -> Result<Value> {
    match template {
        Template::Input { name } => scope
            .inputs
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::MissingInput {
                step: scope.step.clone(),
                input: name.clone(),
            }),
        Template::Value { value } => Ok(value.clone()),
        Template::Element { name } => scope.elements.get(name).cloned().ok_or_else(|| {
            OrchestratorError::MissingInput {
                step: scope.step.clone(),
                input: format!("element:{name}"),
            }
        }),
        Template::Result { name, sub_path } => {
            let root = scope.intermediate_results.get(name).ok_or_else(|| {
                OrchestratorError::MissingResult {
                    step: scope.step.clone(),
                    result_of: name.clone(),
                }
            })?;
            navigate_subpath(root, sub_path).ok_or_else(|| OrchestratorError::ArgumentSubpath {
                step: scope.step.clone(),
                result_of: name.clone(),
                path: sub_path.clone(),
            })
        }
    }
}

/// Walks `path` via map field access.
fn navigate_subpath(root: &Value, path: &[String]) -> Option<Value> {
    let mut current = root;
    for key in path {
        current = current.as_object()?.get(key)?;
    }
    Some(current.clone())
}
