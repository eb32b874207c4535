// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! A dynamic, concurrent, dependency-resolving saga orchestrator.
//!
//! Given a declarative [`Reactor`] — named inputs plus named [`Step`]s with
//! typed argument dependencies — [`executor::run`] plans an execution graph,
//! runs as many steps as possible in parallel, and on failure unwinds
//! completed steps in reverse order via each step's `undo`.
//!
//! The crate is organized around that flow: [`template`] and [`step`]
//! define the data model a [`Reactor`] is built from, [`planner`] turns a
//! step set into a DAG,
//! [`concurrency`] is the cross-reactor semaphore pool, [`executor`] is the
//! scheduling loop, [`runner`] resolves one step's arguments, [`saga`] is
//! rollback, and [`primitives`] builds `Compose`/`Group`/`Around`/`Switch`/
//! `Map` on top of all of it.

pub mod concurrency;
pub mod context;
pub mod error;
pub mod executor;
pub mod middleware;
pub mod planner;
pub mod primitives;
pub mod reactor;
pub mod retry;
pub mod runner;
pub mod saga;
pub mod step;
pub mod template;

pub use error::{OrchestratorError, Result};
pub use executor::{run, ExecutionOutcome, ExecutorOptions};
pub use reactor::{new_step, Reactor, ReactorBuilder, ReactorState};
pub use step::{
    AsyncPolicy, CompensationOutcome, MaxRetries, RunOutcome, Step, StepImpl, StepName, StepOptions, StepRef, UndoOutcome,
};
pub use template::{Argument, Template};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
