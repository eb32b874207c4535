// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Black-box scenario tests against the public API: a basic linear pipeline,
//! an undoable saga unwound both on failure and on demand, compensation-driven
//! retry accounting, undo-retry exhaustion, switch branching, and nested
//! result sub-path resolution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use saga_orchestrator_core::executor::ExecState;
use saga_orchestrator_core::middleware::{Event, Middleware};
use saga_orchestrator_core::primitives::{is_nil_or_false, switch_step, Branch, SwitchSpec};
use saga_orchestrator_core::reactor::UndoEntry;
use saga_orchestrator_core::saga;
use saga_orchestrator_core::{
    run, Argument, AsyncPolicy, CompensationOutcome, ExecutionOutcome, ExecutorOptions, MaxRetries, ReactorBuilder, RunOutcome, Step,
    StepImpl, StepOptions, Template, UndoOutcome,
};

fn inputs(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// ---- S1: basic pipeline ---------------------------------------------------

struct Split;
#[async_trait]
impl StepImpl for Split {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let text = args.get("text").and_then(Value::as_str).unwrap_or_default();
        let words: Vec<Value> = text.split_whitespace().map(|w| Value::String(w.to_string())).collect();
        RunOutcome::Ok(Value::Array(words))
    }
}

struct Reverse;
#[async_trait]
impl StepImpl for Reverse {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let mut words = args.get("words").and_then(Value::as_array).cloned().unwrap_or_default();
        words.reverse();
        RunOutcome::Ok(Value::Array(words))
    }
}

struct Join;
#[async_trait]
impl StepImpl for Join {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let words = args.get("words").and_then(Value::as_array).cloned().unwrap_or_default();
        let joined = words.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" ");
        RunOutcome::Ok(Value::String(joined))
    }
}

#[tokio::test]
async fn s1_basic_pipeline_splits_reverses_and_joins() {
    let reactor = ReactorBuilder::new()
        .add_input("name")
        .add_step(Step::new("split", Arc::new(Split)).with_arguments(vec![Argument::new("text", Template::input("name"))]))
        .add_step(Step::new("reverse", Arc::new(Reverse)).with_arguments(vec![Argument::new("words", Template::result("split"))]))
        .add_step(Step::new("join", Arc::new(Join)).with_arguments(vec![Argument::new("words", Template::result("reverse"))]))
        .return_step("join")
        .build();

    let outcome = run(reactor, inputs(&[("name", Value::from("Marty McFly"))]), ExecutorOptions::default())
        .await
        .unwrap();

    match outcome {
        ExecutionOutcome::Successful(v) => assert_eq!(v, Value::from("McFly Marty")),
        ExecutionOutcome::Halted(_) => panic!("expected success"),
    }
}

// ---- S2: undoable saga -----------------------------------------------------

struct PushAgent {
    agent: Arc<Mutex<Vec<String>>>,
    tag: String,
}

#[async_trait]
impl StepImpl for PushAgent {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        self.agent.lock().unwrap().insert(0, self.tag.clone());
        RunOutcome::Ok(Value::String(self.tag.clone()))
    }

    async fn undo(&self, _value: &Value, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> UndoOutcome {
        let mut agent = self.agent.lock().unwrap();
        if let Some(pos) = agent.iter().position(|v| v == &self.tag) {
            agent.remove(pos);
        }
        UndoOutcome::Ok
    }

    fn is_undoable(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn s2_undoable_saga_pushes_then_explicit_undo_unwinds() {
    let agent = Arc::new(Mutex::new(vec![":z".to_string()]));

    let reactor = ReactorBuilder::new()
        .add_step(Step::new("push_a", Arc::new(PushAgent { agent: agent.clone(), tag: ":a".to_string() })))
        .add_step(
            Step::new("push_b", Arc::new(PushAgent { agent: agent.clone(), tag: ":b".to_string() }))
                .with_arguments(vec![Argument::discard(Template::result("push_a"))]),
        )
        .return_step("push_b")
        .build();

    let outcome = run(reactor, HashMap::new(), ExecutorOptions::default()).await.unwrap();
    match outcome {
        ExecutionOutcome::Successful(v) => assert_eq!(v, Value::from(":b")),
        ExecutionOutcome::Halted(_) => panic!("expected success"),
    }
    assert_eq!(*agent.lock().unwrap(), vec![":b".to_string(), ":a".to_string(), ":z".to_string()]);

    // Explicit undo(r): unwind the same pair of completed steps in LIFO
    // order via the same rollback routine the executor uses on failure.
    let mut reactor = ReactorBuilder::new().build();
    reactor.undo_stack.push(UndoEntry {
        step: Step::new("push_a", Arc::new(PushAgent { agent: agent.clone(), tag: ":a".to_string() })),
        value: Value::from(":a"),
        args_snapshot: Map::new(),
    });
    reactor.undo_stack.push(UndoEntry {
        step: Step::new("push_b", Arc::new(PushAgent { agent: agent.clone(), tag: ":b".to_string() })),
        value: Value::from(":b"),
        args_snapshot: Map::new(),
    });

    let mut exec = ExecState::default();
    saga::rollback(&mut reactor, &mut exec, Duration::from_secs(1)).await;

    assert!(exec.errors.is_empty());
    assert_eq!(*agent.lock().unwrap(), vec![":z".to_string()]);
}

// ---- S3: compensation with retry accounting --------------------------------

struct RecordingMiddleware(Mutex<Vec<String>>);

#[async_trait]
impl Middleware for RecordingMiddleware {
    async fn event(&self, event: &Event) {
        let label = match event {
            Event::RunStart { .. } => "run_start",
            Event::RunComplete { .. } => "run_complete",
            Event::RunError { .. } => "run_error",
            Event::RunRetry { .. } => "run_retry",
            Event::RunHalt { .. } => "run_halt",
            Event::CompensateStart { .. } => "compensate_start",
            Event::CompensateComplete { .. } => "compensate_complete",
            Event::CompensateRetry { .. } => "compensate_retry",
            Event::CompensateContinue { .. } => "compensate_continue",
            Event::CompensateError { .. } => "compensate_error",
            Event::UndoStart { .. } => "undo_start",
            Event::UndoComplete { .. } => "undo_complete",
            Event::UndoRetry { .. } => "undo_retry",
            Event::UndoError { .. } => "undo_error",
            Event::ProcessStart => "process_start",
            Event::ProcessComplete => "process_complete",
        };
        self.0.lock().unwrap().push(label.to_string());
    }
}

struct FlakyThenDone(AtomicU32);

#[async_trait]
impl StepImpl for FlakyThenDone {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        let attempt = self.0.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            RunOutcome::Error(":fail".to_string())
        } else {
            RunOutcome::Ok(Value::from(":done"))
        }
    }

    async fn compensate(&self, _error: &String, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> CompensationOutcome {
        CompensationOutcome::Retry
    }
}

#[tokio::test]
async fn s3_compensation_retries_twice_then_succeeds() {
    let events = Arc::new(RecordingMiddleware(Mutex::new(Vec::new())));
    let reactor = ReactorBuilder::new()
        .add_step(Step::new("flaky", Arc::new(FlakyThenDone(AtomicU32::new(0)))).with_max_retries(MaxRetries::Count(3)))
        .return_step("flaky")
        .add_middleware(events.clone())
        .build();

    let outcome = run(reactor, HashMap::new(), ExecutorOptions::default()).await.unwrap();
    match outcome {
        ExecutionOutcome::Successful(v) => assert_eq!(v, Value::from(":done")),
        ExecutionOutcome::Halted(_) => panic!("expected success"),
    }

    let recorded = events.0.lock().unwrap().clone();
    assert_eq!(
        recorded,
        vec![
            "process_start",
            "run_start",
            "run_error",
            "compensate_start",
            "compensate_retry",
            "run_start",
            "run_error",
            "compensate_start",
            "compensate_retry",
            "run_start",
            "run_complete",
            "process_complete",
        ]
    );
}

// ---- S4: undo retry exhaustion ---------------------------------------------

struct AlwaysFailsWith(&'static str);

#[async_trait]
impl StepImpl for AlwaysFailsWith {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        RunOutcome::Error(self.0.to_string())
    }
}

#[tokio::test]
async fn s4_undo_retry_exhaustion_surfaces_undo_retries_exceeded() {
    let undo_attempts = Arc::new(AtomicU32::new(0));

    struct CountingRetryUndo(Arc<AtomicU32>);
    #[async_trait]
    impl StepImpl for CountingRetryUndo {
        async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
            RunOutcome::Ok(Value::from(":marty"))
        }
        async fn undo(&self, _value: &Value, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> UndoOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            UndoOutcome::Retry
        }
        fn is_undoable(&self) -> bool {
            true
        }
    }

    let reactor = ReactorBuilder::new()
        .add_step(Step::new("undo_step", Arc::new(CountingRetryUndo(undo_attempts.clone()))))
        .add_step(
            Step::new("fail", Arc::new(AlwaysFailsWith(":doc_brown")))
                .with_arguments(vec![Argument::discard(Template::result("undo_step"))]),
        )
        .return_step("fail")
        .build();

    let err = run(reactor, HashMap::new(), ExecutorOptions::default()).await.unwrap_err();
    assert!(err.to_string().contains("undo retries"));
    assert_eq!(undo_attempts.load(Ordering::SeqCst), 5);
}

// ---- S5: switch preceding steps executed once ------------------------------

struct CountingStep(Arc<AtomicU32>, Value);

#[async_trait]
impl StepImpl for CountingStep {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        self.0.fetch_add(1, Ordering::SeqCst);
        RunOutcome::Ok(self.1.clone())
    }
}

#[tokio::test]
async fn s5_switch_preceding_steps_run_exactly_once() {
    let moo_calls = Arc::new(AtomicU32::new(0));
    let boo_calls = Arc::new(AtomicU32::new(0));
    let falsy_calls = Arc::new(AtomicU32::new(0));
    let truthy_calls = Arc::new(AtomicU32::new(0));

    let spec = SwitchSpec {
        branches: vec![Branch::new(
            Arc::new(is_nil_or_false),
            vec![Step::new("falsy", Arc::new(CountingStep(falsy_calls.clone(), Value::from("falsy"))))],
        )],
        default: Some(vec![Step::new("truthy", Arc::new(CountingStep(truthy_calls.clone(), Value::from("truthy"))))]),
        allow_async: true,
    };

    let reactor = ReactorBuilder::new()
        .add_input("flag")
        .add_step(Step::new("moo", Arc::new(CountingStep(moo_calls.clone(), Value::from("moo")))))
        .add_step(
            Step::new("boo", Arc::new(CountingStep(boo_calls.clone(), Value::Bool(false))))
                .with_arguments(vec![Argument::discard(Template::result("moo"))]),
        )
        .add_step(switch_step("switch", Template::result("boo"), spec))
        .return_step("switch")
        .build();

    let outcome = run(reactor, inputs(&[("flag", Value::Bool(true))]), ExecutorOptions::default())
        .await
        .unwrap();

    assert!(matches!(outcome, ExecutionOutcome::Successful(v) if v == Value::from("falsy")));
    assert_eq!(moo_calls.load(Ordering::SeqCst), 1);
    assert_eq!(boo_calls.load(Ordering::SeqCst), 1);
    assert_eq!(falsy_calls.load(Ordering::SeqCst), 1);
    assert_eq!(truthy_calls.load(Ordering::SeqCst), 0);
}

// ---- S6: nested result sub-path --------------------------------------------

struct LevelOne;
#[async_trait]
impl StepImpl for LevelOne {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        RunOutcome::Ok(json!({"level_two": {"level_three": "deep_value"}}))
    }
}

struct Consumer;
#[async_trait]
impl StepImpl for Consumer {
    async fn run(&self, args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        RunOutcome::Ok(args.get("value").cloned().unwrap_or(Value::Null))
    }
}

#[tokio::test]
async fn s6_consumer_resolves_nested_result_subpath() {
    let reactor = ReactorBuilder::new()
        .add_step(Step::new("level_one", Arc::new(LevelOne)))
        .add_step(Step::new("consumer", Arc::new(Consumer)).with_arguments(vec![Argument::new(
            "value",
            Template::result_path("level_one", vec!["level_two".to_string(), "level_three".to_string()]),
        )]))
        .return_step("consumer")
        .build();

    let outcome = run(reactor, HashMap::new(), ExecutorOptions::default()).await.unwrap();
    assert!(matches!(outcome, ExecutionOutcome::Successful(v) if v == Value::from("deep_value")));
}

// ---- S7: concurrent async dispatch honors the pool cap ---------------------

/// Counts its own invocations and tracks how many instances are mid-`run` at
/// once (recording the high-water mark) — used to catch a step being
/// dispatched a second time while its first attempt is still in flight, and
/// to confirm the shared pool never lets more than `max_concurrency` steps
/// overlap.
struct ConcurrentProbe {
    call_count: Arc<AtomicU32>,
    current: Arc<AtomicU32>,
    max_seen: Arc<AtomicU32>,
    delay: Duration,
    value: Value,
}

#[async_trait]
impl StepImpl for ConcurrentProbe {
    async fn run(&self, _args: &Map<String, Value>, _ctx: &Value, _opts: &StepOptions) -> RunOutcome {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        let n = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(n, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        RunOutcome::Ok(self.value.clone())
    }
}

/// Three independent async steps under a pool capped at 2: the first two
/// fill the pool, then the fast one (`probe_0`) finishes and frees a slot
/// while the slow one (`probe_1`) is still running. That freed slot is the
/// exact window in which a missing "already running" guard would re-dispatch
/// `probe_1` a second time — this asserts it doesn't, and that the cap is
/// never exceeded either.
#[tokio::test]
async fn s7_independent_async_steps_run_exactly_once_under_a_capped_pool() {
    let current = Arc::new(AtomicU32::new(0));
    let max_seen = Arc::new(AtomicU32::new(0));
    let counts: Vec<Arc<AtomicU32>> = (0..3).map(|_| Arc::new(AtomicU32::new(0))).collect();
    let delays = [Duration::from_millis(5), Duration::from_millis(150), Duration::from_millis(5)];

    let mut builder = ReactorBuilder::new();
    for (i, count) in counts.iter().enumerate() {
        builder = builder.add_step(
            Step::new(
                format!("probe_{i}"),
                Arc::new(ConcurrentProbe {
                    call_count: count.clone(),
                    current: current.clone(),
                    max_seen: max_seen.clone(),
                    delay: delays[i],
                    value: Value::from(i as u64),
                }),
            )
            .with_async(AsyncPolicy::Fixed(true)),
        );
    }
    let reactor = builder.return_step("probe_0").build();

    let outcome = run(reactor, HashMap::new(), ExecutorOptions::default().with_max_concurrency(2))
        .await
        .unwrap();

    assert!(matches!(outcome, ExecutionOutcome::Successful(v) if v == Value::from(0u64)));
    for (i, count) in counts.iter().enumerate() {
        assert_eq!(count.load(Ordering::SeqCst), 1, "probe_{i} must run exactly once, not be re-dispatched while in flight");
    }
    assert!(max_seen.load(Ordering::SeqCst) <= 2, "pool cap of 2 must never be exceeded");
    assert_eq!(current.load(Ordering::SeqCst), 0, "no step should still be marked in flight after completion");
}
