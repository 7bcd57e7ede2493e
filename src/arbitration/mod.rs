//! Automated responder arbitration.

mod arbiter;
pub mod context;

pub use arbiter::{ArbitrationOutcome, FallbackKind, ResponseArbiter};
pub use context::{CustomerContext, build_context_block};
