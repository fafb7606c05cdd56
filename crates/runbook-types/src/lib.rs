//! Shared domain types for the Runbook workflow engine.
//!
//! This crate holds the data shapes that cross crate boundaries: workflow
//! definitions, run state, step results, and repository errors. It contains
//! no business logic and depends on nothing but serde and friends.

pub mod error;
pub mod workflow;
