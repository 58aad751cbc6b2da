//! CAS Registry Number validation.
//!
//! A CASRN is two to seven digits, two digits and a single check digit,
//! joined by hyphens. The check digit is the sum of every other digit
//! weighted by its position counted from the right, modulo 10.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::Casrn;

static CASRN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2,7})[-\u{2013}\u{2014}](\d{2})[-\u{2013}\u{2014}]\d")
        .expect("CASRN pattern is a valid regex")
});

/// Returns the canonically hyphenated CASRN if `value` carries a valid one.
/// Anything that is not a digit is ignored, so `"50--00--0 "` is accepted.
pub fn normalize(value: &str) -> Option<String> {
    let digits: Vec<u32> = value.chars().filter_map(|ch| ch.to_digit(10)).collect();
    if digits.len() < 5 || digits.len() > 10 {
        return None;
    }
    let (body, check) = digits.split_at(digits.len() - 1);
    let sum: u32 = body
        .iter()
        .rev()
        .enumerate()
        .map(|(idx, digit)| digit * (idx as u32 + 1))
        .sum();
    if sum % 10 != check[0] {
        return None;
    }
    let text: String = digits
        .iter()
        .filter_map(|digit| char::from_digit(*digit, 10))
        .collect();
    let len = text.len();
    Some(format!(
        "{}-{}-{}",
        &text[..len - 3],
        &text[len - 3..len - 1],
        &text[len - 1..]
    ))
}

pub fn is_valid(value: &str) -> bool {
    normalize(value).is_some()
}

/// Finds every valid CASRN in free text, in order of appearance.
pub fn find_valid(text: &str) -> Vec<Casrn> {
    CASRN_PATTERN
        .find_iter(text)
        .filter_map(|found| found.as_str().parse().ok())
        .collect()
}
