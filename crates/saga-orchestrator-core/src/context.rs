// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The reactor's `context`: user data plus the internal
//! `private.*` bookkeeping fields (`private.inputs`, `private.composed_reactors`,
//! `concurrency_key`, `current_step`).

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::concurrency::PoolKey;
use crate::step::StepName;

/// Stable identity used to detect composition recursion.
pub type ReactorId = Uuid;

/// Internal bookkeeping the driver carries alongside user context.
#[derive(Debug, Clone, Default)]
pub struct PrivateContext {
    pub inputs: HashMap<String, Value>,
    pub composed_reactors: HashSet<ReactorId>,
    pub concurrency_key: Option<PoolKey>,
    pub current_step: Option<StepName>,
}

/// `context: map` — user-supplied data plus the private fields
/// above. [`ExecutionContext::to_step_view`] is what a [`crate::step::StepImpl`]
/// actually receives: a single JSON object merging user context with a
/// read-only projection of the private fields a step is allowed to see.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    pub user: Map<String, Value>,
    pub private: PrivateContext,
}

impl ExecutionContext {
    pub fn new(inputs: HashMap<String, Value>) -> Self {
        Self {
            user: Map::new(),
            private: PrivateContext {
                inputs,
                ..Default::default()
            },
        }
    }

    /// Merges a step's `context_patch` into the user-visible context.
    pub fn merge_patch(&mut self, patch: &Map<String, Value>) {
        for (k, v) in patch {
            self.user.insert(k.clone(), v.clone());
        }
    }

    /// Builds the JSON view passed to step implementations: user context
    /// plus a serializable `private` projection (current step, concurrency
    /// key) — the fields a `StepImpl` can read but never mutate directly.
    pub fn to_step_view(&self) -> Value {
        let mut view = self.user.clone();
        let mut private = Map::new();
        if let Some(step) = &self.private.current_step {
            private.insert("current_step".to_string(), Value::String(step.clone()));
        }
        if let Some(key) = self.private.concurrency_key {
            private.insert(
                "concurrency_key".to_string(),
                Value::String(key.to_string()),
            );
        }
        private.insert(
            "composed_reactors".to_string(),
            Value::Array(
                self.private
                    .composed_reactors
                    .iter()
                    .map(|id| Value::String(id.to_string()))
                    .collect(),
            ),
        );
        view.insert("private".to_string(), Value::Object(private));
        Value::Object(view)
    }
}
