//! Parsing customer replies to the survey question.

use super::state::Rating;

/// Variation selector that follows keycap emoji digits.
const VARIATION_SELECTOR: char = '\u{FE0F}';
/// Combining enclosing keycap.
const KEYCAP: char = '\u{20E3}';

/// Interpret a reply as a 1–5 rating.
///
/// Accepts a bare digit with surrounding whitespace and the keycap emoji form
/// (`4️⃣`). Anything else, including `10` or `4 estrelas`, is not a rating.
pub fn classify_rating(text: &str) -> Option<Rating> {
    let cleaned: String = text
        .trim()
        .chars()
        .filter(|c| *c != VARIATION_SELECTOR && *c != KEYCAP)
        .collect();
    let value: u8 = cleaned.trim().parse().ok()?;
    Rating::new(value)
}
