//! Train number extraction, reused by C3/C4/C6 (§4.3). Grounded in
//! `app/utils/train_numbers.py`: strip platform tokens, then prefer the
//! longest 4-6 digit run anchored at the end of the string, falling back to
//! any 3-6 digit run.

use compact_str::CompactString;
use regex::Regex;
use std::sync::LazyLock;

static PLATFORM_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)PLATF\.?\s*\([^)]*\)").unwrap());
static SUFFIX_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{4,6})\s*$").unwrap());
static ANY_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{3,6})").unwrap());

/// Extract a train number from any candidate string (trip_id, block_id,
/// short_name, label, headsign). Returns `None` when nothing plausible is
/// found.
pub fn extract(candidate: &str) -> Option<CompactString> {
    if candidate.is_empty() {
        return None;
    }
    let stripped = PLATFORM_TOKEN.replace_all(candidate, "");

    if let Some(caps) = SUFFIX_RUN.captures(&stripped) {
        return Some(CompactString::from(&caps[1]));
    }
    ANY_RUN
        .captures(&stripped)
        .map(|caps| CompactString::from(&caps[1]))
}

/// Parity of a numeric train identifier, used as a directional hint (§4.4, GLOSSARY).
pub fn parity_of(train_number: &str) -> Option<crate::domain::Parity> {
    let n: i64 = train_number.parse().ok()?;
    Some(if n % 2 == 0 {
        crate::domain::Parity::Even
    } else {
        crate::domain::Parity::Odd
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_suffix_run_over_earlier_digits() {
        assert_eq!(extract("T1_04521").as_deref(), Some("04521"));
    }

    #[test]
    fn falls_back_to_any_run_when_no_trailing_run() {
        assert_eq!(extract("C123_extra").as_deref(), Some("123"));
    }

    #[test]
    fn strips_platform_tokens_before_matching() {
        assert_eq!(extract("PLATF.(2) 04521").as_deref(), Some("04521"));
    }

    #[test]
    fn none_when_no_digits() {
        assert_eq!(extract("no-digits-here"), None);
    }

    #[test]
    fn parity_even_odd() {
        assert_eq!(parity_of("4522"), Some(crate::domain::Parity::Even));
        assert_eq!(parity_of("4521"), Some(crate::domain::Parity::Odd));
        assert_eq!(parity_of("abc"), None);
    }
}
