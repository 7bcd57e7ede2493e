//! Order data, the snapshot recipients are derived from.

pub mod source;

pub use source::{HttpOrderSource, OrderSource};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::phone;

/// Invoice status that arms the restricted-prefix rule.
pub const PREFIX_TRIGGER_STATUS: &str = "billed";
/// Invoice series that arms the restricted-prefix rule.
pub const PREFIX_TRIGGER_SERIES: &str = "N";
/// Invoice number prefix that arms the restricted-prefix rule.
pub const PREFIX_TRIGGER_INVOICE: &str = "050/";

/// Per-order facts used by eligibility rules, templates and AI context.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderContext {
    pub order_number: String,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub invoice_status: Option<String>,
    #[serde(default)]
    pub invoice_series: Option<String>,
    #[serde(default)]
    pub invoice_number: Option<String>,
    #[serde(default)]
    pub delivery_date: Option<NaiveDate>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub cargo: Option<String>,
}

impl OrderContext {
    pub fn new(order_number: impl Into<String>) -> Self {
        Self {
            order_number: order_number.into(),
            ..Default::default()
        }
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver_name = Some(driver.into());
        self
    }

    pub fn with_invoice(
        mut self,
        status: impl Into<String>,
        series: impl Into<String>,
        number: impl Into<String>,
    ) -> Self {
        self.invoice_status = Some(status.into());
        self.invoice_series = Some(series.into());
        self.invoice_number = Some(number.into());
        self
    }

    pub fn with_delivery_date(mut self, date: NaiveDate) -> Self {
        self.delivery_date = Some(date);
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// True only for billed, series `N` invoices numbered `050/...`.
    ///
    /// The restricted-prefix rule must not fire outside this condition.
    pub fn arms_prefix_rule(&self) -> bool {
        let status_ok = self
            .invoice_status
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(PREFIX_TRIGGER_STATUS));
        let series_ok = self
            .invoice_series
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case(PREFIX_TRIGGER_SERIES));
        let number_ok = self
            .invoice_number
            .as_deref()
            .is_some_and(|n| n.trim().starts_with(PREFIX_TRIGGER_INVOICE));
        status_ok && series_ok && number_ok
    }
}

/// One row of the order-data provider's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub customer_name: String,
    pub customer_phone: String,
    #[serde(flatten)]
    pub order: OrderContext,
}

/// A send target: normalized phone, display name and the orders it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub phone: String,
    pub name: String,
    #[serde(default)]
    pub orders: Vec<OrderContext>,
}

impl Recipient {
    /// Build a recipient, normalizing the phone.
    pub fn new(phone: &str, name: impl Into<String>) -> Self {
        Self {
            phone: phone::normalize(phone),
            name: name.into(),
            orders: Vec::new(),
        }
    }

    pub fn with_order(mut self, order: OrderContext) -> Self {
        self.orders.push(order);
        self
    }

    /// The order used for templates and the send record snapshot.
    pub fn primary_order(&self) -> Option<&OrderContext> {
        self.orders.first()
    }

    /// First word of the display name.
    pub fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

/// Group an order snapshot into recipients, one per normalized phone.
///
/// Recipients keep the order in which their phone first appears; rows with
/// an unusable phone are dropped.
pub fn recipients_from_orders(records: Vec<OrderRecord>) -> Vec<Recipient> {
    let mut recipients: Vec<Recipient> = Vec::new();
    for record in records {
        if !phone::is_plausible(&record.customer_phone) {
            tracing::debug!(
                order = %record.order.order_number,
                "Dropping order with unusable phone"
            );
            continue;
        }
        let normalized = phone::normalize(&record.customer_phone);
        match recipients.iter_mut().find(|r| r.phone == normalized) {
            Some(existing) => existing.orders.push(record.order),
            None => recipients.push(
                Recipient::new(&normalized, record.customer_name.trim()).with_order(record.order),
            ),
        }
    }
    recipients
}

/// Drop repeated phones, keeping the first occurrence.
pub fn dedupe_recipients(recipients: Vec<Recipient>) -> Vec<Recipient> {
    let mut seen = std::collections::HashSet::new();
    recipients
        .into_iter()
        .filter(|r| seen.insert(r.phone.clone()))
        .collect()
}
