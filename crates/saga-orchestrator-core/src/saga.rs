// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The saga engine: LIFO rollback once the executor latches an
//! unrecoverable error.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::OrchestratorError;
use crate::executor::ExecState;
use crate::middleware::Event;
use crate::reactor::Reactor;
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::step::UndoOutcome;

/// Default bound on undo attempts per step.
pub const DEFAULT_UNDO_RETRIES: u32 = 5;

/// The backoff curve between undo retries — short and linear, since an undo
/// retry is typically recovering from a transient failure in someone else's
/// system, not waiting out a rate limit.
fn undo_retry_policy() -> RetryPolicy {
    RetryPolicy::from_strategy(
        BackoffStrategy::Linear,
        Duration::from_millis(20),
        Duration::from_millis(200),
        DEFAULT_UNDO_RETRIES,
    )
}

/// Pops the undo stack LIFO, calling `undo` for each entry and accumulating
/// every failure into `exec.errors` without short-circuiting the unwind —
/// every step still gets attempted.
pub async fn rollback(reactor: &mut Reactor, exec: &mut ExecState, halt_timeout: Duration) {
    debug!(reactor_id = %reactor.id, depth = reactor.undo_stack.len(), "starting rollback");
    while let Some(entry) = reactor.undo_stack.pop() {
        debug!(step = %entry.step.name, "undoing step");
        for mw in &reactor.middleware {
            mw.event(&Event::UndoStart { step: entry.step.name.clone() }).await;
        }
        let mut attempt = 1u32;
        loop {
            let ctx_view = reactor.context.to_step_view();
            let undo_future = crate::executor::guard_panic(
                entry.step.implementation.undo(&entry.value, &entry.args_snapshot, &ctx_view, &entry.step.options),
                |msg| UndoOutcome::Error(format!("undo panicked: {msg}")),
            );
            let invocation = tokio::time::timeout(halt_timeout, undo_future).await;

            match invocation {
                Err(_) => {
                    exec.errors.push(OrchestratorError::HaltTimeout { elapsed: halt_timeout });
                    for mw in &reactor.middleware {
                        mw.event(&Event::UndoError { step: entry.step.name.clone(), err: "halt timeout".to_string() }).await;
                    }
                    break;
                }
                Ok(UndoOutcome::Ok) => {
                    for mw in &reactor.middleware {
                        mw.event(&Event::UndoComplete { step: entry.step.name.clone() }).await;
                    }
                    break;
                }
                Ok(UndoOutcome::Retry) => {
                    if attempt >= DEFAULT_UNDO_RETRIES {
                        exec.errors.push(OrchestratorError::UndoRetriesExceeded {
                            step: entry.step.name.clone(),
                            retry_count: attempt,
                        });
                        for mw in &reactor.middleware {
                            mw.event(&Event::UndoError { step: entry.step.name.clone(), err: "undo retries exceeded".to_string() }).await;
                        }
                        break;
                    }
                    for mw in &reactor.middleware {
                        mw.event(&Event::UndoRetry { step: entry.step.name.clone(), reason: None }).await;
                    }
                    tokio::time::sleep(undo_retry_policy().delay_for(attempt)).await;
                    attempt += 1;
                    continue;
                }
                Ok(UndoOutcome::Error(cause)) => {
                    warn!(step = %entry.step.name, cause = %cause, "undo step failed");
                    for mw in &reactor.middleware {
                        mw.event(&Event::UndoError { step: entry.step.name.clone(), err: cause.clone() }).await;
                    }
                    exec.errors.push(OrchestratorError::UndoStepError {
                        step: entry.step.name.clone(),
                        cause,
                    });
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::{Reactor, ReactorBuilder, UndoEntry};
    use crate::step::{tests_support::noop_step, RunOutcome, Step, StepImpl, StepOptions};
    use async_trait::async_trait;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct CountingUndo(Arc<AtomicU32>);

    #[async_trait]
    impl StepImpl for CountingUndo {
        async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
            RunOutcome::Ok(Value::Null)
        }

        async fn undo(&self, _value: &Value, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> crate::step::UndoOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            crate::step::UndoOutcome::Ok
        }

        fn is_undoable(&self) -> bool {
            true
        }
    }

    fn empty_reactor() -> Reactor {
        ReactorBuilder::new()
            .add_step(Step::new("noop", noop_step()))
            .return_step("noop")
            .build()
    }

    #[tokio::test]
    async fn rollback_unwinds_lifo_and_visits_every_entry() {
        let mut reactor = empty_reactor();
        let counter = Arc::new(AtomicU32::new(0));
        reactor.undo_stack.push(UndoEntry {
            step: Step::new("a", Arc::new(CountingUndo(counter.clone()))),
            value: Value::Null,
            args_snapshot: Map::new(),
        });
        reactor.undo_stack.push(UndoEntry {
            step: Step::new("b", Arc::new(CountingUndo(counter.clone()))),
            value: Value::Null,
            args_snapshot: Map::new(),
        });

        let mut exec = ExecState::default();
        rollback(&mut reactor, &mut exec, Duration::from_secs(1)).await;

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(exec.errors.is_empty());
        assert!(reactor.undo_stack.is_empty());
    }

    struct AlwaysErrorsUndo;

    #[async_trait]
    impl StepImpl for AlwaysErrorsUndo {
        async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
            RunOutcome::Ok(Value::Null)
        }

        async fn undo(&self, _value: &Value, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> crate::step::UndoOutcome {
            crate::step::UndoOutcome::Error("boom".to_string())
        }

        fn is_undoable(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn rollback_continues_past_a_failing_undo() {
        let mut reactor = empty_reactor();
        reactor.undo_stack.push(UndoEntry {
            step: Step::new("a", Arc::new(AlwaysErrorsUndo)),
            value: Value::Null,
            args_snapshot: Map::new(),
        });
        reactor.undo_stack.push(UndoEntry {
            step: Step::new("b", Arc::new(AlwaysErrorsUndo)),
            value: Value::Null,
            args_snapshot: Map::new(),
        });

        let mut exec = ExecState::default();
        rollback(&mut reactor, &mut exec, Duration::from_secs(1)).await;

        assert_eq!(exec.errors.len(), 2);
    }
}
