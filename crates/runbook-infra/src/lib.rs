//! Infrastructure adapters for the Runbook workflow engine.
//!
//! Implements the ports defined in `runbook-core`:
//! - `sqlite` -- `RunRepository` backed by SQLite (WAL, split pools)
//! - `executors` -- built-in step executors for `command`, `http`, `wait`,
//!   and `message` steps. `agent` and `delegate` executors are supplied by
//!   the embedding application.

pub mod executors;
pub mod sqlite;
