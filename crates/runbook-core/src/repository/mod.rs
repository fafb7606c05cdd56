//! Repository trait definitions ("ports").
//!
//! The infrastructure layer implements these against concrete storage.

pub mod run;

pub use run::RunRepository;
