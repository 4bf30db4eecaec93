// 🔢 Water Meter Entity - one counter bound to one account and one point
//
// Lifecycle: Active → Replaced (terminal). Ownership changes rebind the same
// instance without a state transition.
//
// The last_reading_* fields are a cache over the reading history, rebuilt by
// the engine's recalculation and never treated as a source of truth.

use crate::excess::ExcessStatus;
use crate::units::MeasurementUnit;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterMeter {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub id: String,
    pub name: String,
    pub unit: MeasurementUnit,

    // ========================================================================
    // BINDINGS
    // ========================================================================
    pub account_id: String,
    pub water_point_id: String,

    // ========================================================================
    // LIFECYCLE
    // ========================================================================
    pub is_active: bool,

    /// Successor created when this meter was replaced
    pub replaced_by_id: Option<String>,
    pub replaced_at: Option<DateTime<Utc>>,

    // ========================================================================
    // CACHE (derived from readings)
    // ========================================================================
    /// Latest reading in liters; None until the first reading
    pub last_reading_normalized_value: Option<Decimal>,
    pub last_reading_date: Option<DateTime<Utc>>,
    /// None means "not yet computable"
    pub last_reading_excess_consumption: Option<bool>,

    pub created_at: DateTime<Utc>,
}

impl WaterMeter {
    pub fn new(
        name: String,
        unit: MeasurementUnit,
        account_id: String,
        water_point_id: String,
    ) -> Self {
        WaterMeter {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            unit,
            account_id,
            water_point_id,
            is_active: true,
            replaced_by_id: None,
            replaced_at: None,
            last_reading_normalized_value: None,
            last_reading_date: None,
            last_reading_excess_consumption: None,
            created_at: Utc::now(),
        }
    }

    /// Successor meter for a replacement: same account, same point, empty history.
    pub fn successor(&self, name: String, unit: MeasurementUnit) -> WaterMeter {
        WaterMeter::new(name, unit, self.account_id.clone(), self.water_point_id.clone())
    }

    /// Close this meter in favour of `successor_id`.
    pub fn close(&mut self, successor_id: &str, at: DateTime<Utc>) {
        self.is_active = false;
        self.replaced_by_id = Some(successor_id.to_string());
        self.replaced_at = Some(at);
    }

    pub fn excess_status(&self) -> ExcessStatus {
        ExcessStatus::from(self.last_reading_excess_consumption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_meter_has_empty_cache() {
        let meter = WaterMeter::new(
            "Main".to_string(),
            MeasurementUnit::Liters,
            "acc-1".to_string(),
            "point-1".to_string(),
        );
        assert!(meter.is_active);
        assert!(meter.last_reading_normalized_value.is_none());
        assert_eq!(meter.excess_status(), ExcessStatus::Unknown);
    }

    #[test]
    fn test_successor_keeps_bindings() {
        let mut old = WaterMeter::new(
            "Main".to_string(),
            MeasurementUnit::Liters,
            "acc-1".to_string(),
            "point-1".to_string(),
        );
        let new = old.successor("Main v2".to_string(), MeasurementUnit::CubicMeters);
        old.close(&new.id, Utc::now());

        assert_ne!(old.id, new.id);
        assert_eq!(new.account_id, "acc-1");
        assert_eq!(new.water_point_id, "point-1");
        assert_eq!(new.unit, MeasurementUnit::CubicMeters);
        assert!(!old.is_active);
        assert_eq!(old.replaced_by_id.as_deref(), Some(new.id.as_str()));
    }
}
