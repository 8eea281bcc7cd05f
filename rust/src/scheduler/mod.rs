//! Per-tick driver tying registry, demand, coalition split and EXP-PF
//! distribution together.

mod core;
mod stats;

pub use core::{Scheduler, SchedulerError};
pub use stats::SchedulerStats;
