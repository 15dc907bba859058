//! Contact identifier normalization.
//!
//! Channels deliver phone numbers in many shapes ("+54 9 11 1111-1111",
//! "01111111111", "5491111111111"). Everything downstream keys on the
//! canonical `+<country><number>` form produced here.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::PipelineError;

/// Country code assumed for numbers without one.
pub const DEFAULT_COUNTRY_CODE: &str = "54";

/// Mobile marker inserted after the Argentine country code.
const AR_MOBILE_MARKER: char = '9';

/// Length of an Argentine national number (area code + subscriber).
const AR_NATIONAL_LEN: usize = 10;

const MIN_INTERNATIONAL_DIGITS: usize = 8;
const MAX_INTERNATIONAL_DIGITS: usize = 15;

/// Visual separators stripped before parsing.
static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\s\-\.\(\)/]").expect("separator regex is valid"));

/// Normalizes raw contact identifiers for one default country.
#[derive(Debug, Clone)]
pub struct PhoneNormalizer {
    country_code: String,
}

impl Default for PhoneNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_COUNTRY_CODE)
    }
}

impl PhoneNormalizer {
    pub fn new(country_code: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
        }
    }

    /// Normalize to `+<digits>`. Idempotent on canonical input.
    pub fn normalize(&self, raw: &str) -> Result<String, PipelineError> {
        let invalid = || PipelineError::InvalidContact(raw.to_string());

        let cleaned = SEPARATORS.replace_all(raw.trim(), "");
        // WhatsApp ids sometimes carry a "@c.us" / "@s.whatsapp.net" suffix.
        let cleaned = cleaned.split('@').next().unwrap_or_default();

        let (international, digits) = if let Some(rest) = cleaned.strip_prefix('+') {
            (true, rest)
        } else if let Some(rest) = cleaned.strip_prefix("00") {
            (true, rest)
        } else {
            (false, cleaned)
        };

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid());
        }

        let full = if international || self.has_country_code(digits) {
            digits.to_string()
        } else {
            let national = digits.strip_prefix('0').unwrap_or(digits);
            if national.len() != AR_NATIONAL_LEN || self.country_code != DEFAULT_COUNTRY_CODE {
                return Err(invalid());
            }
            format!("{}{}", self.country_code, national)
        };

        let full = self.insert_mobile_marker(full);

        if !(MIN_INTERNATIONAL_DIGITS..=MAX_INTERNATIONAL_DIGITS).contains(&full.len()) {
            return Err(invalid());
        }

        Ok(format!("+{full}"))
    }

    /// Digits already start with the default country code and have the
    /// length of a full international number.
    fn has_country_code(&self, digits: &str) -> bool {
        digits.starts_with(&self.country_code)
            && digits.len() >= self.country_code.len() + AR_NATIONAL_LEN
    }

    /// Argentine mobiles are addressed as 54 9 <national>; add the 9 when a
    /// 54-prefixed number arrives without it.
    fn insert_mobile_marker(&self, digits: String) -> String {
        if self.country_code != DEFAULT_COUNTRY_CODE {
            return digits;
        }
        match digits.strip_prefix(DEFAULT_COUNTRY_CODE) {
            Some(national)
                if national.len() == AR_NATIONAL_LEN
                    && !national.starts_with(AR_MOBILE_MARKER) =>
            {
                format!("{DEFAULT_COUNTRY_CODE}{AR_MOBILE_MARKER}{national}")
            }
            _ => digits,
        }
    }
}

/// Normalize with the default country.
pub fn normalize(raw: &str) -> Result<String, PipelineError> {
    PhoneNormalizer::default().normalize(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_is_unchanged() {
        assert_eq!(normalize("+5491111111111").unwrap(), "+5491111111111");
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in [
            "+54 9 11 1111-1111",
            "5491122223333",
            "011 2222 3333",
            "0054 9 351 444 5555",
            "+1 (415) 555-0100",
        ] {
            let once = normalize(raw).unwrap();
            let twice = normalize(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {raw}");
        }
    }

    #[test]
    fn strips_separators() {
        assert_eq!(normalize("+54 9 11 1111-1111").unwrap(), "+5491111111111");
        assert_eq!(normalize("(+54) 9.11.1111.1111").unwrap(), "+5491111111111");
    }

    #[test]
    fn local_number_gets_country_and_mobile_marker() {
        assert_eq!(normalize("011 2222 3333").unwrap(), "+5491122223333");
        assert_eq!(normalize("1122223333").unwrap(), "+5491122223333");
    }

    #[test]
    fn country_code_without_mobile_marker() {
        assert_eq!(normalize("541122223333").unwrap(), "+5491122223333");
        assert_eq!(normalize("+541122223333").unwrap(), "+5491122223333");
    }

    #[test]
    fn double_zero_prefix_is_international() {
        assert_eq!(normalize("0054 9 351 444 5555").unwrap(), "+5493514445555");
    }

    #[test]
    fn whatsapp_suffix_is_dropped() {
        assert_eq!(normalize("5491111111111@c.us").unwrap(), "+5491111111111");
    }

    #[test]
    fn foreign_international_numbers_pass_through() {
        assert_eq!(normalize("+1 (415) 555-0100").unwrap(), "+14155550100");
    }

    #[test]
    fn local_fifteen_prefix_is_not_rewritten() {
        assert!(matches!(
            normalize("011 15 2222 3333"),
            Err(PipelineError::InvalidContact(_))
        ));
        assert_eq!(normalize("011 2222 3333").unwrap(), "+5491122223333");
    }

    #[test]
    fn rejects_garbage() {
        for raw in ["", "   ", "hola", "+54abc", "12345", "+1234567890123456789"] {
            assert!(
                matches!(normalize(raw), Err(PipelineError::InvalidContact(_))),
                "expected rejection for {raw:?}"
            );
        }
    }
}
