//! Time-based message scheduling: entries, validation, and the tick loop.

pub mod entry;
pub mod scheduler;

pub use entry::{ScheduleEntry, ScheduleSpec};
pub use scheduler::{ScheduleDraft, Scheduler, spawn_ticker};
