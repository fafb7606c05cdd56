//! Workflow compiler, execution engine, and repository ports for Runbook.
//!
//! This crate defines the "ports" (the `RunRepository` trait and the
//! `StepExecutor` interface) that the infrastructure layer implements. It
//! depends only on `runbook-types` -- never on `runbook-infra` or any
//! database/IO crate.

pub mod repository;
pub mod service;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;
