//! Dedup window expiry across partition ownership changes.

mod error;
mod manager;
mod service;
mod timer;

pub use error::DedupError;
pub use manager::{ClearReason, DedupClear, DedupExpiryManager};
pub use service::{DedupInput, DedupRequest, DedupService, run_dedup_loop};
pub use timer::{ManualScheduler, Scheduler, ThreadScheduler, TimerHandle, TimerToken};
