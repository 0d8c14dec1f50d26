//! Worker lifecycle: per-assignment polling loops and their supervisor.

pub mod state;
pub mod supervisor;
pub mod worker;

pub use state::{WorkerRecord, WorkerState};
pub use supervisor::WorkerSupervisor;
pub use worker::WorkerDeps;
