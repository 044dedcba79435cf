//! Byte sizes for configuration values and progress display

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const KIB: u64 = 1024;

/// Binary units, largest last. Each entry lists the accepted spellings; the
/// first one is used for display.
const UNITS: [(&[&str], u64); 5] = [
    (&["B", ""], 1),
    (&["KB", "K", "KIB"], KIB),
    (&["MB", "M", "MIB"], KIB * KIB),
    (&["GB", "G", "GIB"], KIB * KIB * KIB),
    (&["TB", "T", "TIB"], KIB * KIB * KIB * KIB),
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid size format: {0}")]
    InvalidFormat(String),

    #[error("Invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),

    #[error("Invalid unit: {0}")]
    InvalidUnit(String),

    #[error("Size overflows 64 bits: {0}")]
    Overflow(String),
}

/// Byte count that deserializes from `"256KB"`-style strings or integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct ByteSize(pub u64);

impl ByteSize {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for ByteSize {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        let split = normalized
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(normalized.len());
        let (digits, unit) = normalized.split_at(split);
        if digits.is_empty() {
            return Err(ParseError::InvalidFormat(s.to_string()));
        }

        let count: u64 = digits.parse()?;
        let unit = unit.trim();
        let multiplier = UNITS
            .iter()
            .find(|(names, _)| names.contains(&unit))
            .map(|&(_, multiplier)| multiplier)
            .ok_or_else(|| ParseError::InvalidUnit(unit.to_string()))?;

        count
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| ParseError::Overflow(s.to_string()))
    }
}

/// Largest unit that fits, with one truncated decimal when it is non-zero:
/// `1536` is `1.5KB`, `1024` is `1KB`
impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (names, divisor) = UNITS
            .iter()
            .rev()
            .find(|&&(_, divisor)| self.0 >= divisor)
            .copied()
            .unwrap_or(UNITS[0]);
        let whole = self.0 / divisor;
        let tenths = (self.0 % divisor) * 10 / divisor;

        if tenths == 0 {
            write!(f, "{}{}", whole, names[0])
        } else {
            write!(f, "{}.{}{}", whole, tenths, names[0])
        }
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ByteSizeVisitor;

        impl serde::de::Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a byte size such as \"512KB\" or an integer")
            }

            fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(ByteSize(v))
            }

            // TOML and environment sources hand integers over as i64
            fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("byte size cannot be negative: {v}")))
            }

            fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse::<ByteSize>().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// `"400B / 1000B (40%)"`, or just the transferred amount when the total is unknown
pub fn format_progress(partial: u64, total: Option<u64>) -> String {
    match total {
        Some(total) if total > 0 => format!(
            "{} / {} ({}%)",
            ByteSize(partial),
            ByteSize(total),
            partial.saturating_mul(100) / total
        ),
        _ => ByteSize(partial).to_string(),
    }
}
