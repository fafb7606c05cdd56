//! SQLite persistence for workflow run checkpoints.

pub mod pool;
pub mod run;

pub use pool::DatabasePool;
pub use run::SqliteRunRepository;
