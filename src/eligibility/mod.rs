//! Recipient eligibility — blacklist, restricted drivers, restricted prefixes.

pub mod rules;

pub use rules::{RejectReason, RuleSnapshot, SendPath, Verdict};
