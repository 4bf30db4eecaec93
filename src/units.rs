// 💧 Unit Normalizer - every stored reading is expressed in liters
//
// Raw values come from operators in the community's locale:
// comma is the decimal separator, dot groups thousands ("1.234,5" = 1234.5).

use crate::error::{MeteringError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Liters per cubic meter
const LITERS_PER_M3: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

// ============================================================================
// MEASUREMENT UNIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementUnit {
    /// Liters
    #[serde(rename = "L")]
    Liters,

    /// Cubic meters
    #[serde(rename = "M3")]
    CubicMeters,
}

impl MeasurementUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasurementUnit::Liters => "L",
            MeasurementUnit::CubicMeters => "M3",
        }
    }

    /// Liters represented by one unit of this kind
    pub fn factor(&self) -> Decimal {
        match self {
            MeasurementUnit::Liters => Decimal::ONE,
            MeasurementUnit::CubicMeters => LITERS_PER_M3,
        }
    }
}

impl fmt::Display for MeasurementUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeasurementUnit {
    type Err = MeteringError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "L" => Ok(MeasurementUnit::Liters),
            "M3" => Ok(MeasurementUnit::CubicMeters),
            _ => Err(MeteringError::UnknownUnit(s.to_string())),
        }
    }
}

// ============================================================================
// NORMALIZATION
// ============================================================================

/// Convert a raw meter value into liters.
pub fn normalize(value: Decimal, unit: MeasurementUnit) -> Result<Decimal> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(MeteringError::invalid_reading(
            &value.to_string(),
            "reading values cannot be negative",
        ));
    }
    value
        .checked_mul(unit.factor())
        .map(|liters| liters.normalize())
        .ok_or_else(|| MeteringError::invalid_reading(&value.to_string(), "value out of range"))
}

/// Parse a locale-formatted raw value and normalize it in one step.
pub fn normalize_raw(raw: &str, unit: MeasurementUnit) -> Result<Decimal> {
    let value = parse_locale_decimal(raw)?;
    normalize(value, unit)
}

/// Parse a reading typed with comma decimals and optional dot thousands groups.
///
/// A dot is only accepted as a thousands separator: every group after the
/// first must have exactly three digits, so "12.5" is rejected instead of
/// being read as 125 or 12.5.
pub fn parse_locale_decimal(raw: &str) -> Result<Decimal> {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return Err(MeteringError::invalid_reading(raw, "empty value"));
    }
    if trimmed.starts_with('-') {
        return Err(MeteringError::invalid_reading(
            raw,
            "reading values cannot be negative",
        ));
    }

    let mut parts = trimmed.splitn(2, ',');
    let integer_part = parts.next().unwrap_or_default();
    let fraction_part = parts.next();

    if let Some(fraction) = fraction_part {
        if fraction.is_empty() || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return Err(MeteringError::invalid_reading(raw, "malformed decimal part"));
        }
    }

    let integer_digits = strip_thousands(raw, integer_part)?;

    let canonical = match fraction_part {
        Some(fraction) => format!("{}.{}", integer_digits, fraction),
        None => integer_digits,
    };

    Decimal::from_str(&canonical)
        .map_err(|e| MeteringError::invalid_reading(raw, e.to_string()))
}

fn strip_thousands(raw: &str, integer_part: &str) -> Result<String> {
    if integer_part.is_empty() {
        return Err(MeteringError::invalid_reading(raw, "missing integer part"));
    }

    let groups: Vec<&str> = integer_part.split('.').collect();
    let all_digits = |g: &str| !g.is_empty() && g.chars().all(|c| c.is_ascii_digit());

    if !groups.iter().all(|g| all_digits(g)) {
        return Err(MeteringError::invalid_reading(raw, "not a number"));
    }

    if groups.len() > 1 {
        let first_ok = groups[0].len() <= 3;
        let rest_ok = groups[1..].iter().all(|g| g.len() == 3);
        if !first_ok || !rest_ok {
            return Err(MeteringError::invalid_reading(
                raw,
                "dot is the thousands separator; use a comma for decimals",
            ));
        }
    }

    Ok(groups.concat())
}

// ============================================================================
// TESTS
// ============================================================================
