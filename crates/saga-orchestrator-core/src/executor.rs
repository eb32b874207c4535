// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! The executor core: the driver loop that turns a planned
//! [`Reactor`] into a result, honoring concurrency limits, backoff, and the
//! Executing / UndoRequested / Halting mode machine.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::concurrency::{ConcurrencyTracker, PoolKey, PoolOwnerGuard};
use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result, SagaFailure};
use crate::middleware::Event;
use crate::reactor::{Reactor, ReactorState, UndoEntry};
use crate::runner;
use crate::saga;
use crate::step::{CompensationOutcome, GuardOutcome, RunOutcome, Step, StepRef};

/// `run(...)` options.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub max_concurrency: u32,
    pub timeout: Option<Duration>,
    pub max_iterations: Option<u64>,
    pub halt_timeout: Duration,
    pub async_enabled: bool,
    pub concurrency_key: Option<PoolKey>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(4),
            timeout: None,
            max_iterations: None,
            halt_timeout: Duration::from_secs(5),
            async_enabled: true,
            concurrency_key: None,
        }
    }
}

impl ExecutorOptions {
    pub fn with_max_concurrency(mut self, n: u32) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_iterations(mut self, n: u64) -> Self {
        self.max_iterations = Some(n);
        self
    }

    pub fn with_halt_timeout(mut self, timeout: Duration) -> Self {
        self.halt_timeout = timeout;
        self
    }

    pub fn with_async_enabled(mut self, enabled: bool) -> Self {
        self.async_enabled = enabled;
        self
    }

    pub fn with_concurrency_key(mut self, key: PoolKey) -> Self {
        self.concurrency_key = Some(key);
        self
    }
}

/// The engine-level result of a `run` invocation |
/// Error(err) | Halted(reactor)`"). Named distinctly from [`RunOutcome`]
/// (a single step's outcome) to keep the two layers apart.
pub enum ExecutionOutcome {
    Successful(Value),
    Halted(Box<Reactor>),
}

/// Per-invocation bookkeeping kept outside the reactor.
#[derive(Default)]
pub struct ExecState {
    pub retries: HashMap<StepRef, u32>,
    pub pending_backoffs: HashMap<StepRef, Instant>,
    pub errors: Vec<OrchestratorError>,
    /// Steps currently dispatched as an in-flight async task but not yet
    /// removed from the plan — `reactor.plan.ready()` still reports them
    /// (the plan only drops a step on completion, in `finalize_success`), so
    /// the ready loop consults this set to avoid dispatching the same step
    /// a second time while its first attempt is still running.
    pub running: HashSet<StepRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DriverMode {
    Executing,
    UndoRequested,
    Halting,
}

struct PendingResult {
    step: Step,
    args: Map<String, Value>,
    outcome: RunOutcome,
}

/// Entry point. Builds a fresh [`ExecutionContext`] from
/// `inputs` and runs to completion.
pub async fn run(reactor: Reactor, inputs: HashMap<String, Value>, options: ExecutorOptions) -> Result<ExecutionOutcome> {
    run_with_context(reactor, ExecutionContext::new(inputs), options).await
}

/// Same as [`run`] but with a caller-supplied context — used by the
/// `Compose` primitive to pass down a `composed_reactors` chain
/// and an inherited concurrency key.
pub async fn run_with_context(mut reactor: Reactor, context: ExecutionContext, options: ExecutorOptions) -> Result<ExecutionOutcome> {
    reactor.context = context;
    reactor.state = ReactorState::Executing;
    reactor.validate()?;
    reactor.ensure_planned()?;

    info!(reactor_id = %reactor.id, max_concurrency = options.max_concurrency, "starting reactor run");
    debug!(ready = ?reactor.plan.ready(), "initial ready set");

    for mw in &reactor.middleware {
        mw.init().await;
        mw.event(&Event::ProcessStart).await;
    }

    let tracker = ConcurrencyTracker::global();
    let (key, _owner_guard) = match options.concurrency_key {
        Some(key) => (key, PoolOwnerGuard::new(tracker, key)),
        None => {
            let key = tracker.allocate(options.max_concurrency);
            (key, PoolOwnerGuard::adopt(tracker, key))
        }
    };
    reactor.context.private.concurrency_key = Some(key);

    let mut exec = ExecState::default();
    let mut tasks: JoinSet<PendingResult> = JoinSet::new();
    let mut mode = DriverMode::Executing;
    let started_at = Instant::now();
    let mut iterations: u64 = 0;

    let outcome = loop {
        iterations += 1;
        if mode == DriverMode::Executing {
            if let Some(max_iterations) = options.max_iterations {
                if iterations > max_iterations {
                    mode = DriverMode::Halting;
                }
            }
            if let Some(timeout) = options.timeout {
                if started_at.elapsed() >= timeout {
                    mode = DriverMode::Halting;
                }
            }
        }

        // Drain whatever has completed without blocking.
        while let Some(joined) = tasks.try_join_next() {
            tracker.release(key);
            let pending = joined.map_err(|e| OrchestratorError::other(e.to_string()))?;
            handle_completion(&mut reactor, &mut exec, pending, &mut mode).await?;
        }

        match mode {
            DriverMode::UndoRequested => {
                if tasks.is_empty() {
                    saga::rollback(&mut reactor, &mut exec, options.halt_timeout).await;
                    break Err(SagaFailure(std::mem::take(&mut exec.errors)).into());
                }
                await_one(&mut tasks, &mut reactor, &mut exec, &mut mode, tracker, key, options.halt_timeout).await?;
                continue;
            }
            DriverMode::Halting => {
                if tasks.is_empty() {
                    reactor.state = ReactorState::Halted;
                    warn!(reactor_id = %reactor.id, iterations, "reactor run halted");
                    for mw in &reactor.middleware {
                        mw.halt().await;
                    }
                    break Ok(ExecutionOutcome::Halted(Box::new(reactor)));
                }
                await_one(&mut tasks, &mut reactor, &mut exec, &mut mode, tracker, key, options.halt_timeout).await?;
                continue;
            }
            DriverMode::Executing => {}
        }

        let ready = reactor.plan.ready();
        let mut dispatched_async = false;
        let mut runnable_sync: Option<StepRef> = None;
        let mut earliest_backoff: Option<Instant> = None;

        for name in &ready {
            let Some(step) = reactor.steps.get(name).cloned() else {
                continue;
            };
            if exec.running.contains(&step.step_ref) {
                continue;
            }
            if let Some(deadline) = exec.pending_backoffs.get(&step.step_ref) {
                if Instant::now() < *deadline {
                    earliest_backoff = Some(match earliest_backoff {
                        Some(e) if e < *deadline => e,
                        _ => *deadline,
                    });
                    continue;
                }
            }

            let wants_async = options.async_enabled && step.async_policy.evaluate(&step.options);

            if wants_async {
                if tasks.len() as u32 >= options.max_concurrency {
                    continue;
                }
                if tracker.acquire(key) != Some(true) {
                    continue;
                }
                let invocation = match runner::prepare(&mut reactor, &step) {
                    Ok(inv) => inv,
                    Err(e) => {
                        tracker.release(key);
                        return Err(e);
                    }
                };
                match runner::evaluate_guards(&step, &invocation) {
                    GuardOutcome::Skip => {
                        tracker.release(key);
                        handle_completion(
                            &mut reactor,
                            &mut exec,
                            PendingResult { step, args: invocation.args, outcome: RunOutcome::Ok(Value::Null) },
                            &mut mode,
                        )
                        .await?;
                    }
                    GuardOutcome::Substitute(v) => {
                        tracker.release(key);
                        handle_completion(
                            &mut reactor,
                            &mut exec,
                            PendingResult { step, args: invocation.args, outcome: RunOutcome::Ok(v) },
                            &mut mode,
                        )
                        .await?;
                    }
                    GuardOutcome::Proceed => {
                        dispatched_async = true;
                        exec.running.insert(step.step_ref.clone());
                        let middleware = reactor.middleware.clone();
                        let dispatch_step = step.clone();
                        debug!(step = %dispatch_step.name, "dispatching step async");
                        tasks.spawn(async move {
                            for mw in &middleware {
                                mw.event(&Event::RunStart { step: dispatch_step.name.clone() }).await;
                            }
                            let started = Instant::now();
                            let outcome = guard_panic(
                                dispatch_step.implementation.run(&invocation.args, &invocation.ctx_view, &dispatch_step.options),
                                |msg| RunOutcome::Error(format!("step panicked: {msg}")),
                            )
                            .await;
                            debug!(step = %dispatch_step.name, duration_ms = started.elapsed().as_millis(), "step run finished");
                            PendingResult { step: dispatch_step, args: invocation.args, outcome }
                        });
                    }
                }
            } else if runnable_sync.is_none() {
                runnable_sync = Some(step.step_ref.clone());
            }
        }

        if !dispatched_async && tasks.is_empty() {
            if let Some(step_ref) = runnable_sync {
                let name = reactor.steps.values().find(|s| s.step_ref == step_ref).map(|s| s.name.clone());
                if let Some(name) = name {
                    let step = reactor.steps.get(&name).cloned().unwrap();
                    let invocation = runner::prepare(&mut reactor, &step)?;
                    match runner::evaluate_guards(&step, &invocation) {
                        GuardOutcome::Skip => {
                            handle_completion(
                                &mut reactor,
                                &mut exec,
                                PendingResult { step, args: invocation.args, outcome: RunOutcome::Ok(Value::Null) },
                                &mut mode,
                            )
                            .await?;
                        }
                        GuardOutcome::Substitute(v) => {
                            handle_completion(
                                &mut reactor,
                                &mut exec,
                                PendingResult { step, args: invocation.args, outcome: RunOutcome::Ok(v) },
                                &mut mode,
                            )
                            .await?;
                        }
                        GuardOutcome::Proceed => {
                            for mw in &reactor.middleware {
                                mw.event(&Event::RunStart { step: step.name.clone() }).await;
                            }
                            debug!(step = %step.name, "dispatching step synchronously");
                            let outcome = guard_panic(
                                step.implementation.run(&invocation.args, &invocation.ctx_view, &step.options),
                                |msg| RunOutcome::Error(format!("step panicked: {msg}")),
                            )
                            .await;
                            handle_completion(
                                &mut reactor,
                                &mut exec,
                                PendingResult { step, args: invocation.args, outcome },
                                &mut mode,
                            )
                            .await?;
                        }
                    }
                    continue;
                }
            }
        }

        if reactor.plan.is_empty() && tasks.is_empty() {
            let return_name = reactor.return_step.clone().ok_or(OrchestratorError::MissingReturn)?;
            let value = reactor.intermediate_results.get(&return_name).cloned().unwrap_or(Value::Null);
            reactor.state = ReactorState::Successful;
            info!(reactor_id = %reactor.id, iterations, "reactor run completed successfully");
            for mw in &reactor.middleware {
                mw.complete(&value).await;
                mw.event(&Event::ProcessComplete).await;
            }
            break Ok(ExecutionOutcome::Successful(value));
        }

        // Nothing was dispatched and no sync step ran this iteration (a sync
        // run above always `continue`s). If a sync step is ready but blocked
        // behind in-flight async work, block on the next completion rather
        // than busy-spinning on `try_join_next`.
        if !dispatched_async {
            if !tasks.is_empty() {
                await_one(&mut tasks, &mut reactor, &mut exec, &mut mode, tracker, key, options.halt_timeout).await?;
            } else if let Some(deadline) = earliest_backoff {
                tokio::time::sleep_until(deadline).await;
            } else if !reactor.plan.is_empty() {
                reactor.state = ReactorState::Failed;
                return Err(OrchestratorError::Stuck);
            }
        }
    };

    if let Err(ref err) = outcome {
        reactor.state = ReactorState::Failed;
        error!(reactor_id = %reactor.id, error = %err, "reactor run failed");
        for mw in &reactor.middleware {
            mw.error(err).await;
        }
    }

    outcome
}

/// Blocks on the earliest in-flight completion, bounded
/// by `halt_timeout` while halting or rolling back.
async fn await_one(
    tasks: &mut JoinSet<PendingResult>,
    reactor: &mut Reactor,
    exec: &mut ExecState,
    mode: &mut DriverMode,
    tracker: &ConcurrencyTracker,
    key: PoolKey,
    halt_timeout: Duration,
) -> Result<()> {
    let bounded = *mode != DriverMode::Executing;
    let joined = if bounded {
        match tokio::time::timeout(halt_timeout, tasks.join_next()).await {
            Ok(joined) => joined,
            Err(_) => return Err(OrchestratorError::HaltTimeout { elapsed: halt_timeout }),
        }
    } else {
        tasks.join_next().await
    };

    if let Some(joined) = joined {
        tracker.release(key);
        let pending = joined.map_err(|e| OrchestratorError::other(e.to_string()))?;
        handle_completion(reactor, exec, pending, mode).await?;
    }
    Ok(())
}

/// Interprets a completed step's [`RunOutcome`].
async fn handle_completion(reactor: &mut Reactor, exec: &mut ExecState, pending: PendingResult, mode: &mut DriverMode) -> Result<()> {
    let PendingResult { step, args, outcome } = pending;
    exec.running.remove(&step.step_ref);

    match outcome {
        RunOutcome::Ok(value) => {
            for mw in &reactor.middleware {
                mw.event(&Event::RunComplete { step: step.name.clone(), value: value.clone() }).await;
            }
            finalize_success(reactor, exec, &step, args, value, Vec::new())
        }
        RunOutcome::OkEmit(value, new_steps) => {
            for mw in &reactor.middleware {
                mw.event(&Event::RunComplete { step: step.name.clone(), value: value.clone() }).await;
            }
            finalize_success(reactor, exec, &step, args, value, new_steps)
        }
        RunOutcome::Retry | RunOutcome::RetryWith(_) => {
            for mw in &reactor.middleware {
                mw.event(&Event::RunRetry {
                    step: step.name.clone(),
                    attempt: exec.retries.get(&step.step_ref).copied().unwrap_or(0) + 1,
                })
                .await;
            }
            handle_retry(reactor, exec, &step, &args, mode).await
        }
        RunOutcome::Halt(value) => {
            for mw in &reactor.middleware {
                mw.event(&Event::RunHalt { step: step.name.clone() }).await;
            }
            reactor.intermediate_results.insert(step.name.clone(), value);
            *mode = DriverMode::Halting;
            Ok(())
        }
        RunOutcome::Error(reason) => {
            error!(step = %step.name, reason = %reason, "step run failed");
            for mw in &reactor.middleware {
                mw.event(&Event::RunError { step: step.name.clone(), reason: reason.clone() }).await;
            }
            for mw in &reactor.middleware {
                mw.event(&Event::CompensateStart { step: step.name.clone(), err: reason.clone() }).await;
            }
            let ctx_view = reactor.context.to_step_view();
            let compensation = guard_panic(step.implementation.compensate(&reason, &args, &ctx_view, &step.options), |msg| {
                CompensationOutcome::Error(format!("compensate panicked: {msg}"))
            })
            .await;
            match compensation {
                CompensationOutcome::Continue(value) => {
                    for mw in &reactor.middleware {
                        mw.event(&Event::CompensateContinue { step: step.name.clone(), value: value.clone() }).await;
                    }
                    finalize_success(reactor, exec, &step, args, value, Vec::new())
                }
                CompensationOutcome::Ok => {
                    for mw in &reactor.middleware {
                        mw.event(&Event::CompensateComplete { step: step.name.clone() }).await;
                    }
                    exec.errors.push(OrchestratorError::RunStepError { step: step.name.clone(), cause: reason });
                    *mode = DriverMode::UndoRequested;
                    Ok(())
                }
                CompensationOutcome::Retry | CompensationOutcome::RetryWith(_) => {
                    for mw in &reactor.middleware {
                        mw.event(&Event::CompensateRetry { step: step.name.clone() }).await;
                    }
                    handle_retry(reactor, exec, &step, &args, mode).await
                }
                CompensationOutcome::Error(cause) => {
                    for mw in &reactor.middleware {
                        mw.event(&Event::CompensateError { step: step.name.clone(), err: cause.clone() }).await;
                    }
                    exec.errors.push(OrchestratorError::CompensateStepError { step: step.name.clone(), cause });
                    *mode = DriverMode::UndoRequested;
                    Ok(())
                }
            }
        }
    }
}

fn finalize_success(
    reactor: &mut Reactor,
    exec: &mut ExecState,
    step: &Step,
    args: Map<String, Value>,
    value: Value,
    new_steps: Vec<Step>,
) -> Result<()> {
    let self_replaced = new_steps.iter().any(|s| s.name == step.name);

    if !self_replaced {
        reactor.intermediate_results.insert(step.name.clone(), value.clone());
        if step.is_undoable() {
            reactor.undo_stack.push(UndoEntry { step: step.clone(), value, args_snapshot: args });
        }
    }

    if !new_steps.is_empty() {
        reactor.inject(new_steps)?;
    }
    if !self_replaced {
        reactor.plan.remove(&step.name);
    }

    reactor.purge_unreferenced_results();

    exec.retries.remove(&step.step_ref);
    exec.pending_backoffs.remove(&step.step_ref);
    Ok(())
}

/// Runs a user step invocation (`run`/`compensate`/`backoff`) with a
/// catch-all around the future: a panicking step body surfaces as whatever
/// `on_panic` builds rather than unwinding the driver loop.
pub(crate) async fn guard_panic<F, T>(fut: F, on_panic: impl FnOnce(String) -> T) -> T
where
    F: std::future::Future<Output = T>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(value) => value,
        Err(payload) => on_panic(panic_message(payload)),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "step panicked".to_string()
    }
}

async fn handle_retry(reactor: &mut Reactor, exec: &mut ExecState, step: &Step, args: &Map<String, Value>, mode: &mut DriverMode) -> Result<()> {
    let attempt = exec.retries.entry(step.step_ref.clone()).or_insert(0);
    *attempt += 1;
    let attempt = *attempt;

    if !step.max_retries.allows(attempt) {
        warn!(step = %step.name, attempt, "retries exhausted, requesting rollback");
        exec.errors.push(OrchestratorError::RetriesExceeded { step: step.name.clone(), retry_count: attempt });
        *mode = DriverMode::UndoRequested;
        return Ok(());
    }

    let ctx_view = reactor.context.to_step_view();
    let delay = guard_panic(step.implementation.backoff(attempt, args, &ctx_view, &step.options), |_| None).await;
    if let Some(delay) = delay {
        debug!(step = %step.name, attempt, delay_ms = delay.as_millis(), "scheduling retry backoff");
        exec.pending_backoffs.insert(step.step_ref.clone(), Instant::now() + delay);
    }
    Ok(())
}
