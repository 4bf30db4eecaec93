// 📟 Water Meter Reading - raw value as typed, normalized value in liters
//
// The raw value stays a string so nothing is rounded before normalization.

use crate::entities::WaterMeter;
use crate::error::Result;
use crate::units;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterMeterReading {
    pub id: String,
    pub meter_id: String,

    /// Value exactly as entered by the operator, in the meter's unit
    pub reading: String,

    /// Same value in liters
    pub normalized_reading: Decimal,

    pub reading_date: DateTime<Utc>,
    pub notes: Option<String>,

    /// Reference to an attached photo of the dial
    pub image_ref: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl WaterMeterReading {
    /// Parse and normalize `raw` under the meter's unit.
    pub fn new(
        meter: &WaterMeter,
        raw: &str,
        reading_date: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<Self> {
        let normalized_reading = units::normalize_raw(raw, meter.unit)?;

        Ok(WaterMeterReading {
            id: uuid::Uuid::new_v4().to_string(),
            meter_id: meter.id.clone(),
            reading: raw.trim().to_string(),
            normalized_reading,
            reading_date,
            notes,
            image_ref: None,
            created_at: Utc::now(),
        })
    }

    pub fn with_image(mut self, image_ref: String) -> Self {
        self.image_ref = Some(image_ref);
        self
    }

    /// Hash for duplicate detection on bulk import (not identity)
    pub fn compute_idempotency_hash(&self) -> String {
        idempotency_hash(&self.meter_id, self.reading_date, &self.reading)
    }
}

pub fn idempotency_hash(meter_id: &str, reading_date: DateTime<Utc>, raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}{}{}", meter_id, reading_date.to_rfc3339(), raw.trim()));
    format!("{:x}", hasher.finalize())
}
