//! Phone number normalization
//!
//! A heuristic, not E.164 validation: strips formatting, adds the Brazilian
//! country code to bare national numbers, and rejects anything too short or
//! too long to dial.

use thiserror::Error;

/// Messaging-network suffixes that may be attached to a number
const CHAT_SUFFIXES: &[&str] = &["@c.us", "@s.whatsapp.net"];

const COUNTRY_CODE: &str = "55";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid phone number: {raw:?}")]
pub struct Rejected {
    pub raw: String,
}

/// Map a raw phone string to digits the gateway can dial.
pub fn normalize(raw: &str) -> Result<String, Rejected> {
    let trimmed = raw.trim();
    let without_suffix = CHAT_SUFFIXES
        .iter()
        .find_map(|suffix| trimmed.strip_suffix(suffix))
        .unwrap_or(trimmed);

    // A leading '+' is dropped like any other formatting, and so is a stray one
    let mut number: String = without_suffix
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();

    if (number.len() == 10 || number.len() == 11) && !number.starts_with(COUNTRY_CODE) {
        let area_code: u32 = number[..2].parse().unwrap_or(0);
        if (11..=99).contains(&area_code) {
            number.insert_str(0, COUNTRY_CODE);
        }
    }

    let national = number.starts_with(COUNTRY_CODE) && (number.len() == 12 || number.len() == 13);
    let international = (10..=15).contains(&number.len());
    if national || international {
        Ok(number)
    } else {
        Err(Rejected { raw: raw.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adds_country_code() {
        assert_eq!(normalize("11987654321").unwrap(), "5511987654321");
        assert_eq!(normalize("1187654321").unwrap(), "551187654321");
    }

    #[test]
    fn test_strips_formatting() {
        assert_eq!(normalize("+55 (11) 98765-4321").unwrap(), "5511987654321");
        assert_eq!(normalize("+5511987654321").unwrap(), "5511987654321");
        assert_eq!(normalize("5511987654321@c.us").unwrap(), "5511987654321");
        assert_eq!(normalize("5511987654321@s.whatsapp.net").unwrap(), "5511987654321");
    }

    #[test]
    fn test_inner_plus_is_stripped() {
        assert_eq!(normalize("5511+987654321").unwrap(), "5511987654321");
        assert_eq!(normalize("+55+11 98765-4321").unwrap(), "5511987654321");
    }

    #[test]
    fn test_area_code_below_eleven_not_prefixed() {
        // "09" is not an area code, but ten digits still pass as international
        assert_eq!(normalize("0987654321").unwrap(), "0987654321");
    }

    #[test]
    fn test_international_numbers_pass() {
        assert_eq!(normalize("+447911123456").unwrap(), "447911123456");
        assert_eq!(normalize("+4915123456789").unwrap(), "4915123456789");
    }

    #[test]
    fn test_eleven_digit_foreign_number_is_treated_as_national() {
        // Indistinguishable from a Brazilian mobile without country code
        assert_eq!(normalize("+14155552671").unwrap(), "5514155552671");
    }

    #[test]
    fn test_rejects() {
        assert!(normalize("").is_err());
        assert!(normalize("123").is_err());
        assert!(normalize("abc").is_err());
        assert!(normalize("1234567890123456").is_err());
    }

    #[test]
    fn test_rejection_keeps_raw_input() {
        let err = normalize("12-3").unwrap_err();
        assert_eq!(err.raw, "12-3");
    }

    #[test]
    fn test_idempotent() {
        for raw in ["11987654321", "+447911123456", "5511987654321@c.us", "1187654321"] {
            let once = normalize(raw).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
        }
    }
}
