//! Process lifecycle: ordered startup, signal handling, bounded drain.

pub mod supervisor;

pub use supervisor::{RunOutcome, Supervisor};
