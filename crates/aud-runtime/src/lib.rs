//! aud-runtime
//!
//! Everything that moves state: the scheduling entry point, the per-scope
//! rate-limit quarantine, and the reconciliation pass that drains the
//! scheduled-update queue.
//!
//! Pure decisions (quota admission, response parsing, validation) live in
//! their own crates; this crate wires them to storage and the fetcher.

mod engine;
mod quarantine;
mod scheduler;

pub use engine::{spawn_pass_tick, PassSummary, ReconciliationEngine, UpdateOutcome};
pub use quarantine::QuarantineTracker;
pub use scheduler::{buyer_from_uri, ScheduleError, ScheduleRequest, Scheduler};
