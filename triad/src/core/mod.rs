//! Deterministic, pure logic shared by the workflow loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod assembly;
pub mod guard;
pub mod immutability;
pub mod invariants;
pub mod normalize;
pub mod progress;
pub mod retrieval;
pub mod state_update;
pub mod types;
