//! Message templates with `{placeholder}` substitution.
//!
//! Known placeholders: `name`, `first_name`, `order`, `driver`,
//! `delivery_date` (DD/MM/YYYY) and `address`. Unknown placeholders are left
//! as written so a typo is visible in the sent text rather than silently dropped.

use std::sync::LazyLock;

use regex::Regex;

use crate::orders::Recipient;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{(\w+)\}").unwrap());

/// Render `template` for `recipient`, using its primary order.
pub fn render(template: &str, recipient: &Recipient) -> String {
    let order = recipient.primary_order();
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let value = match &caps[1] {
                "name" => Some(recipient.name.clone()),
                "first_name" => Some(recipient.first_name().to_string()),
                "order" => Some(order.map(|o| o.order_number.clone()).unwrap_or_default()),
                "driver" => Some(order.and_then(|o| o.driver_name.clone()).unwrap_or_default()),
                "delivery_date" => Some(
                    order
                        .and_then(|o| o.delivery_date)
                        .map(|d| d.format("%d/%m/%Y").to_string())
                        .unwrap_or_default(),
                ),
                "address" => Some(order.and_then(|o| o.address.clone()).unwrap_or_default()),
                _ => None,
            };
            value.unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
