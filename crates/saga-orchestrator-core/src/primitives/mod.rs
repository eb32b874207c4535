// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Dynamic step emission primitives built atop the planner/executor/saga
//! core: `Compose`, `Group`, `Around`, `Switch`, and
//! `Map`/`Iterator`. None of these are special-cased by the executor — each
//! is an ordinary [`crate::step::StepImpl`] that returns `OkEmit` or invokes
//! a nested `run`.

pub mod around;
pub mod compose;
pub mod group;
pub mod map;
pub mod switch;

mod shared;

pub use around::{around_step, AroundCallback, AroundHandler};
pub use compose::{compose_step, ComposeOptions};
pub use group::{group_step, AfterAllHook, BeforeAllHook, GroupOptions};
pub use map::{map_step, Finaliser, GeneratorOutcome, Generator, Initialiser, MapSpec};
pub use switch::{is_nil_or_false, switch_step, Branch, SwitchSpec};
