//! Planner / Worker / QA workflow orchestration over a single LLM.
//!
//! A run drives one model through three roles: the Planner breaks a goal into
//! steps, the Worker produces one artifact per step and QA reviews it. The
//! crate keeps the run honest between turns. The architecture enforces a strict
//! separation:
//!
//! - **[`core`]**: Pure, deterministic logic (normalization, state merging, the
//!   step guard, retrieval). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (providers, search, run storage,
//!   prompts, iteration logs). Isolated behind traits to enable fakes in tests.
//!
//! Orchestration modules ([`start`], [`step`], [`looping`], [`tools`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod start;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
