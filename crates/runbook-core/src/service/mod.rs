//! Use-case services over the workflow engine.
//!
//! Services orchestrate the compiler, engine, and reporter behind the
//! operations a CLI or API surface needs. They depend on ports (the
//! repository and executor traits), never on concrete infrastructure.

pub mod workflow;

pub use workflow::{PlannedStep, ServiceError, WorkflowService};
