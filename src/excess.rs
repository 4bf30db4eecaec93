// 🚨 Excess Classifier - measured volume against the community budget
//
// Result is tri-state: Some(true) excess, Some(false) normal, None unknown
// (not enough readings). Listings must show "unknown", never "normal", for None.

use crate::consumption::{self, Consumption};
use crate::entities::WaterMeterReading;
use crate::limits::LimitPolicy;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub fn classify(consumption: &Consumption, policy: &LimitPolicy, population: u32) -> Option<bool> {
    match consumption {
        Consumption::InsufficientData => None,
        Consumption::Computed { volume, days } => {
            Some(*volume > policy.max_allowed(*days, population))
        }
    }
}

// ============================================================================
// EXCESS STATUS (listing view)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExcessStatus {
    Unknown,
    Normal,
    Excess,
}

impl ExcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExcessStatus::Unknown => "unknown",
            ExcessStatus::Normal => "normal",
            ExcessStatus::Excess => "excess",
        }
    }
}

impl From<Option<bool>> for ExcessStatus {
    fn from(flag: Option<bool>) -> Self {
        match flag {
            None => ExcessStatus::Unknown,
            Some(false) => ExcessStatus::Normal,
            Some(true) => ExcessStatus::Excess,
        }
    }
}

// ============================================================================
// METER CACHE
// ============================================================================

/// Denormalized meter fields, a pure function of the ordered reading history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeterCache {
    pub last_reading_normalized_value: Option<Decimal>,
    pub last_reading_date: Option<DateTime<Utc>>,
    pub last_reading_excess_consumption: Option<bool>,
}

impl MeterCache {
    pub fn derive(ordered: &[WaterMeterReading], policy: &LimitPolicy, population: u32) -> Self {
        let last = ordered.last();
        let latest = consumption::latest_interval(ordered);

        MeterCache {
            last_reading_normalized_value: last.map(|r| r.normalized_reading),
            last_reading_date: last.map(|r| r.reading_date),
            last_reading_excess_consumption: classify(&latest, policy, population),
        }
    }
}
