//! Phone number normalization.
//!
//! Every phone that is written to or compared against the store goes through
//! [`normalize`]: digits only, with the Brazilian country code removed. The
//! country code is re-added by [`to_outbound`] right before a gateway call.

/// Country code stripped for comparisons and re-added for outbound use.
pub const COUNTRY_CODE: &str = "55";

/// Minimum number of digits left after stripping the country code.
const MIN_NATIONAL_DIGITS: usize = 10;

/// Normalize a phone string for storage and comparison.
///
/// Strips all non-digits, then strips a leading `55` while the remainder still
/// has at least ten digits. Stripping repeats until nothing changes, so
/// `normalize(normalize(x)) == normalize(x)` for every input.
pub fn normalize(raw: &str) -> String {
    let mut digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    while digits.starts_with(COUNTRY_CODE) && digits.len() - COUNTRY_CODE.len() >= MIN_NATIONAL_DIGITS
    {
        digits.drain(..COUNTRY_CODE.len());
    }
    digits
}

/// Build the gateway-facing number for a phone (normalized or not).
///
/// National numbers (10 or 11 digits) get the country code prepended; anything
/// else is passed through as digits so the gateway can reject it.
pub fn to_outbound(phone: &str) -> String {
    let national = normalize(phone);
    match national.len() {
        10 | 11 => format!("{COUNTRY_CODE}{national}"),
        _ => national,
    }
}

/// A phone is usable for sending when it normalizes to a national number.
pub fn is_plausible(phone: &str) -> bool {
    matches!(normalize(phone).len(), 10 | 11)
}
