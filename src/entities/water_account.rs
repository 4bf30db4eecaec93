// 👤 Water Account Entity - the person or household holding a meter
//
// Account UUID is identity; a meter can be rebound to another account
// without touching its reading history.

use crate::error::{MeteringError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaterAccount {
    pub id: String,
    pub holder_name: String,
    pub national_id: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WaterAccount {
    pub fn new(holder_name: String, national_id: String, notes: Option<String>) -> Self {
        WaterAccount {
            id: uuid::Uuid::new_v4().to_string(),
            holder_name,
            national_id,
            notes,
            created_at: Utc::now(),
        }
    }
}

/// Data for an account created on the fly (e.g. during an ownership change)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewAccount {
    pub holder_name: String,
    pub national_id: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewAccount {
    /// Holder name and national identifier are both required.
    pub fn is_complete(&self) -> bool {
        !self.holder_name.trim().is_empty() && !self.national_id.trim().is_empty()
    }

    pub fn into_account(self) -> Result<WaterAccount> {
        if !self.is_complete() {
            return Err(MeteringError::AccountDataIncomplete);
        }
        Ok(WaterAccount::new(
            self.holder_name.trim().to_string(),
            self.national_id.trim().to_string(),
            self.notes,
        ))
    }
}
