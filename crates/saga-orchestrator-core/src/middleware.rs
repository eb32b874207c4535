// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Middleware/event hooks: observers attached to a reactor that
//! see every lifecycle event without being able to alter control flow.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OrchestratorError;
use crate::step::StepName;

/// The event taxonomy a [`Middleware`] can observe. Each event
/// fires exactly once per transition; within one step, events are strictly
/// ordered as `run_start -> (run_complete | run_error | run_retry |
/// run_halt)`, followed by `compensate_*` on error and `undo_*` during
/// rollback.
///
/// `ProcessStart`/`ProcessComplete` scope to the whole reactor run rather
/// than an OS process id — this engine schedules steps as async tasks/sync
/// calls on one driver, not as separate processes.
#[derive(Debug, Clone)]
pub enum Event {
    RunStart { step: StepName },
    RunComplete { step: StepName, value: Value },
    RunError { step: StepName, reason: String },
    RunRetry { step: StepName, attempt: u32 },
    RunHalt { step: StepName },
    CompensateStart { step: StepName, err: String },
    CompensateComplete { step: StepName },
    CompensateRetry { step: StepName },
    CompensateContinue { step: StepName, value: Value },
    CompensateError { step: StepName, err: String },
    UndoStart { step: StepName },
    UndoComplete { step: StepName },
    UndoRetry { step: StepName, reason: Option<String> },
    UndoError { step: StepName, err: String },
    ProcessStart,
    ProcessComplete,
}

/// A lifecycle observer. Every method defaults to a no-op, so
/// implementations only override the hooks they care about — the same
/// "small opt-in surface" shape as [`crate::step::StepImpl`]'s defaultable
/// methods.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn init(&self) {}

    async fn event(&self, _event: &Event) {}

    async fn complete(&self, _result: &Value) {}

    async fn halt(&self) {}

    async fn error(&self, _error: &OrchestratorError) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingMiddleware(Arc<AtomicUsize>);

    #[async_trait]
    impl Middleware for CountingMiddleware {
        async fn event(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn event_hook_is_invoked() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mw = CountingMiddleware(counter.clone());
        mw.event(&Event::ProcessStart).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
