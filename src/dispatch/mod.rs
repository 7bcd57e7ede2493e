//! Bulk dispatch: send runs, their records, templating and pacing.

pub mod controller;
pub mod model;
pub mod rate_limiter;
pub mod template;

pub use controller::{RunPlan, SendRunController};
pub use model::{CancelOutcome, RunKind, RunStatus, RunSummary, SendRecord, SendRun, SendStatus};
pub use rate_limiter::RateLimiter;
