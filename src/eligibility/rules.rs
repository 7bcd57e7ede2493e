//! Ordered eligibility rules evaluated against a per-run snapshot.
//!
//! Rules run in order and the first rejection wins:
//! 1. blacklisted phone
//! 2. restricted driver (campaign path only)
//! 3. restricted order prefix, only for billed `N`/`050/` invoices (campaign path only)
//!
//! The snapshot is read once when a run starts, so edits to the rule tables
//! mid-run do not change the outcome for the remaining recipients.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DatabaseError;
use crate::orders::{OrderContext, Recipient};
use crate::phone;
use crate::store::Database;

/// Which send path a message goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendPath {
    /// Bulk notification or survey run. All rules apply.
    Campaign,
    /// Operator one-off send. Only the customer's opt-out applies.
    Manual,
}

impl SendPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Campaign => "campaign",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for SendPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendPath {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaign" => Ok(Self::Campaign),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown send path: {s}")),
        }
    }
}

/// Why a recipient was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Blacklisted,
    RestrictedDriver,
    RestrictedPrefix,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blacklisted => "blacklisted",
            Self::RestrictedDriver => "restricted_driver",
            Self::RestrictedPrefix => "restricted_prefix",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Eligible,
    Rejected(RejectReason),
}

impl Verdict {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }
}

/// Immutable copy of the three rule tables.
#[derive(Debug, Clone, Default)]
pub struct RuleSnapshot {
    blacklist: HashSet<String>,
    /// Lowercased, trimmed driver names.
    drivers: HashSet<String>,
    /// Lowercased prefixes.
    prefixes: Vec<String>,
}

impl RuleSnapshot {
    /// Build a snapshot from raw table contents, normalizing every entry.
    pub fn new<B, D, P>(blacklist: B, drivers: D, prefixes: P) -> Self
    where
        B: IntoIterator<Item = String>,
        D: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        Self {
            blacklist: blacklist.into_iter().map(|p| phone::normalize(&p)).collect(),
            drivers: drivers
                .into_iter()
                .map(|d| d.trim().to_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
            prefixes: prefixes
                .into_iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Read all three tables from the store.
    pub async fn load(store: &dyn Database) -> Result<Self, DatabaseError> {
        let blacklist = store
            .list_blacklist()
            .await?
            .into_iter()
            .map(|entry| entry.phone);
        let drivers = store.list_restricted_drivers().await?;
        let prefixes = store.list_restricted_prefixes().await?;
        let snapshot = Self::new(blacklist, drivers, prefixes);
        debug!(
            blacklist = snapshot.blacklist.len(),
            drivers = snapshot.drivers.len(),
            prefixes = snapshot.prefixes.len(),
            "Eligibility snapshot loaded"
        );
        Ok(snapshot)
    }

    /// Evaluate the rules for one phone and (optionally) one order.
    pub fn is_eligible(&self, phone: &str, order: Option<&OrderContext>, path: SendPath) -> Verdict {
        if self.blacklist.contains(&phone::normalize(phone)) {
            return Verdict::Rejected(RejectReason::Blacklisted);
        }
        if path == SendPath::Manual {
            return Verdict::Eligible;
        }
        let Some(order) = order else {
            return Verdict::Eligible;
        };

        if let Some(driver) = order.driver_name.as_deref() {
            if self.drivers.contains(&driver.trim().to_lowercase()) {
                return Verdict::Rejected(RejectReason::RestrictedDriver);
            }
        }

        if order.arms_prefix_rule() {
            let number = order.order_number.trim().to_lowercase();
            if self.prefixes.iter().any(|p| number.starts_with(p.as_str())) {
                return Verdict::Rejected(RejectReason::RestrictedPrefix);
            }
        }

        Verdict::Eligible
    }

    /// Evaluate a recipient: the phone, then each of its orders.
    pub fn evaluate_recipient(&self, recipient: &Recipient, path: SendPath) -> Verdict {
        if recipient.orders.is_empty() {
            return self.is_eligible(&recipient.phone, None, path);
        }
        for order in &recipient.orders {
            let verdict = self.is_eligible(&recipient.phone, Some(order), path);
            if !verdict.is_eligible() {
                return verdict;
            }
        }
        Verdict::Eligible
    }

    pub fn is_blacklisted(&self, phone: &str) -> bool {
        self.blacklist.contains(&phone::normalize(phone))
    }
}
