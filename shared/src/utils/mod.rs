//! Utility functions and helpers

use thiserror::Error;

/// Error produced when parsing configuration-level values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid {what}: '{value}'")]
    InvalidValue { what: &'static str, value: String },

    #[error("ordinal range must have one or two bounds, got {0}")]
    RangeArity(usize),

    #[error("empty ordinal range [{start}, {end})")]
    EmptyRange { start: u64, end: u64 },
}

/// Parse an integer literal the way C's `strtol(s, NULL, 0)` does:
/// `0x`/`0X` prefix is hexadecimal, a leading `0` is octal, anything else decimal.
pub fn parse_c_integer(s: &str) -> Result<u64, ParseError> {
    let s = s.trim();
    let invalid = || ParseError::InvalidValue {
        what: "integer",
        value: s.to_string(),
    };

    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };

    if digits.is_empty() {
        return Err(invalid());
    }
    u64::from_str_radix(digits, radix).map_err(|_| invalid())
}

/// Split a delimited list, dropping surrounding whitespace and empty items
pub fn split_list<'a>(s: &'a str, delim: char) -> impl Iterator<Item = &'a str> + 'a {
    s.split(delim).map(str::trim).filter(|item| !item.is_empty())
}
