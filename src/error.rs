// ⚠️ Error Taxonomy - Metering Engine
// Validation, consistency and not-found failures are distinct categories so
// callers can tell "bad input" from "stale reference" from "history guard".

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MeteringError {
    // ========================================================================
    // VALIDATION (rejected before any mutation)
    // ========================================================================
    #[error("Invalid reading value '{raw}': {reason}")]
    InvalidReadingValue { raw: String, reason: String },

    #[error("Unknown measurement unit: {0}")]
    UnknownUnit(String),

    #[error("Account data incomplete: an existing account id or holder name and national id are required")]
    AccountDataIncomplete,

    #[error("Unknown limit rule type: {0}")]
    UnknownLimitRuleType(String),

    #[error("Limit rule value must be greater than zero, got {0}")]
    InvalidLimitValue(Decimal),

    #[error("Configuration error: {message}")]
    Config { message: String },

    // ========================================================================
    // CONSISTENCY (protect historical data, never coerced)
    // ========================================================================
    #[error("Reading {candidate} L on meter {meter_id} is below the last recorded value {last} L")]
    NonMonotonicReading {
        meter_id: String,
        candidate: Decimal,
        last: Decimal,
    },

    #[error("Reading dated {candidate} on meter {meter_id} is earlier than the last reading ({last})")]
    BackdatedReading {
        meter_id: String,
        candidate: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("Reading already recorded on meter {meter_id}")]
    DuplicateReading { meter_id: String },

    #[error("Meter {0} is inactive")]
    MeterInactive(String),

    #[error("Reading {0} is not editable (only the two most recent readings of an active meter are)")]
    ReadingNotEditable(String),

    // ========================================================================
    // NOT FOUND
    // ========================================================================
    #[error("Meter not found: {0}")]
    MeterNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Water point not found: {0}")]
    PointNotFound(String),

    #[error("Reading not found: {0}")]
    ReadingNotFound(String),

    #[error("No limit policy configured for zone {zone_id}")]
    PolicyNotFound { zone_id: String },

    // ========================================================================
    // INTERNAL
    // ========================================================================
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV processing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse category of a [`MeteringError`], used by API layers for status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Consistency,
    NotFound,
    Internal,
}

impl MeteringError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeteringError::InvalidReadingValue { .. }
            | MeteringError::UnknownUnit(_)
            | MeteringError::AccountDataIncomplete
            | MeteringError::UnknownLimitRuleType(_)
            | MeteringError::InvalidLimitValue(_)
            | MeteringError::Config { .. } => ErrorKind::Validation,

            MeteringError::NonMonotonicReading { .. }
            | MeteringError::BackdatedReading { .. }
            | MeteringError::DuplicateReading { .. }
            | MeteringError::MeterInactive(_)
            | MeteringError::ReadingNotEditable(_) => ErrorKind::Consistency,

            MeteringError::MeterNotFound(_)
            | MeteringError::AccountNotFound(_)
            | MeteringError::PointNotFound(_)
            | MeteringError::ReadingNotFound(_)
            | MeteringError::PolicyNotFound { .. } => ErrorKind::NotFound,

            MeteringError::Storage(_)
            | MeteringError::Io(_)
            | MeteringError::Csv(_)
            | MeteringError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_reading(raw: &str, reason: impl Into<String>) -> Self {
        MeteringError::InvalidReadingValue {
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeteringError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            MeteringError::invalid_reading("-1", "negative").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MeteringError::NonMonotonicReading {
                meter_id: "m".to_string(),
                candidate: dec!(1),
                last: dec!(2),
            }
            .kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            MeteringError::DuplicateReading { meter_id: "m".to_string() }.kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            MeteringError::MeterNotFound("m".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MeteringError::Storage(rusqlite::Error::QueryReturnedNoRows).kind(),
            ErrorKind::Internal
        );
    }

    #[test]
    fn test_error_messages_carry_values() {
        let err = MeteringError::NonMonotonicReading {
            meter_id: "meter-1".to_string(),
            candidate: dec!(900),
            last: dec!(1000),
        };
        let msg = err.to_string();
        assert!(msg.contains("meter-1"));
        assert!(msg.contains("900"));
        assert!(msg.contains("1000"));
    }
}
