// 🚰 Water Point Entity - where water is delivered
//
// A point is never deleted; population, zone and deposits are edited in place.
// The zone decides which community limit policy applies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterPoint {
    /// Stable identity (UUID)
    pub id: String,

    /// Residents living at the point all year
    pub fixed_population: u32,

    /// Seasonal / visiting population
    pub floating_population: u32,

    /// Zone reference (resolves the community limit policy)
    pub zone_id: String,

    /// Deposits supplying this point
    pub deposit_ids: Vec<String>,

    /// Cadastral reference of the parcel
    pub cadastral_reference: String,

    pub notes: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl WaterPoint {
    pub fn new(
        zone_id: String,
        cadastral_reference: String,
        fixed_population: u32,
        floating_population: u32,
    ) -> Self {
        WaterPoint {
            id: uuid::Uuid::new_v4().to_string(),
            fixed_population,
            floating_population,
            zone_id,
            deposit_ids: Vec::new(),
            cadastral_reference,
            notes: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_deposits(mut self, deposit_ids: Vec<String>) -> Self {
        self.deposit_ids = deposit_ids;
        self
    }

    pub fn with_notes(mut self, notes: String) -> Self {
        self.notes = Some(notes);
        self
    }

    /// Population used by person-based limit rules
    pub fn population(&self) -> u32 {
        self.fixed_population.saturating_add(self.floating_population)
    }
}
