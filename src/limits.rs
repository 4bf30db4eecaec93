// 📏 Limit Policy - maximum allowed consumption for a community
//
// Two rules, chosen per community:
//   PERSON_BASED    → days × (fixed + floating population) × value
//   HOUSEHOLD_BASED → days × value

use crate::error::{MeteringError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PERSON_BASED: &str = "PERSON_BASED";
pub const HOUSEHOLD_BASED: &str = "HOUSEHOLD_BASED";

// ============================================================================
// LIMIT POLICY
// ============================================================================

/// A validated limit rule. Construct through [`LimitPolicy::person_based`],
/// [`LimitPolicy::household_based`] or [`LimitRuleConfig`] so `value > 0` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitPolicy {
    /// Liters per person per day
    PersonBased(Decimal),

    /// Liters per household per day
    HouseholdBased(Decimal),
}

impl LimitPolicy {
    pub fn person_based(value: Decimal) -> Result<Self> {
        ensure_positive(value)?;
        Ok(LimitPolicy::PersonBased(value))
    }

    pub fn household_based(value: Decimal) -> Result<Self> {
        ensure_positive(value)?;
        Ok(LimitPolicy::HouseholdBased(value))
    }

    /// Build from a `type` discriminator; unknown types fail instead of defaulting.
    pub fn from_type(rule_type: &str, value: Decimal) -> Result<Self> {
        match rule_type {
            PERSON_BASED => LimitPolicy::person_based(value),
            HOUSEHOLD_BASED => LimitPolicy::household_based(value),
            other => Err(MeteringError::UnknownLimitRuleType(other.to_string())),
        }
    }

    pub fn rule_type(&self) -> &'static str {
        match self {
            LimitPolicy::PersonBased(_) => PERSON_BASED,
            LimitPolicy::HouseholdBased(_) => HOUSEHOLD_BASED,
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            LimitPolicy::PersonBased(v) | LimitPolicy::HouseholdBased(v) => *v,
        }
    }

    /// Maximum liters allowed over `days` for a point with `population` people.
    ///
    /// Zero (or negative) elapsed days yields a zero budget, so any positive
    /// consumption in a same-day window classifies as excess.
    pub fn max_allowed(&self, days: i64, population: u32) -> Decimal {
        if days <= 0 {
            return Decimal::ZERO;
        }
        let days = Decimal::from(days);
        match self {
            LimitPolicy::PersonBased(value) => days * Decimal::from(population) * *value,
            LimitPolicy::HouseholdBased(value) => days * *value,
        }
    }
}

fn ensure_positive(value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(MeteringError::InvalidLimitValue(value));
    }
    Ok(())
}

// ============================================================================
// CONFIGURATION SHAPE
// ============================================================================

/// `{ type = "PERSON_BASED" | "HOUSEHOLD_BASED", value = <number > 0> }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRuleConfig {
    #[serde(rename = "type")]
    pub rule_type: String,
    pub value: Decimal,
}

impl TryFrom<&LimitRuleConfig> for LimitPolicy {
    type Error = MeteringError;

    fn try_from(config: &LimitRuleConfig) -> Result<Self> {
        LimitPolicy::from_type(config.rule_type.trim(), config.value)
    }
}

impl From<LimitPolicy> for LimitRuleConfig {
    fn from(policy: LimitPolicy) -> Self {
        LimitRuleConfig {
            rule_type: policy.rule_type().to_string(),
            value: policy.value(),
        }
    }
}

// ============================================================================
// POLICY BOOK
// ============================================================================

/// Zone → limit policy lookup, built once when configuration is loaded.
#[derive(Debug, Clone, Default)]
pub struct PolicyBook {
    by_zone: HashMap<String, LimitPolicy>,
}

impl PolicyBook {
    pub fn new() -> Self {
        PolicyBook {
            by_zone: HashMap::new(),
        }
    }

    /// Attach a policy to a zone. A zone may only belong to one community.
    pub fn assign(&mut self, zone_id: &str, policy: LimitPolicy) -> Result<()> {
        if self.by_zone.contains_key(zone_id) {
            return Err(MeteringError::Config {
                message: format!("zone '{}' is assigned to more than one community", zone_id),
            });
        }
        self.by_zone.insert(zone_id.to_string(), policy);
        Ok(())
    }

    pub fn policy_for_zone(&self, zone_id: &str) -> Result<LimitPolicy> {
        self.by_zone
            .get(zone_id)
            .copied()
            .ok_or_else(|| MeteringError::PolicyNotFound {
                zone_id: zone_id.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.by_zone.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_zone.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_person_based_max() {
        let policy = LimitPolicy::person_based(dec!(50)).unwrap();
        assert_eq!(policy.max_allowed(3, 10), dec!(1500));
    }

    #[test]
    fn test_household_based_ignores_population() {
        let policy = LimitPolicy::household_based(dec!(200)).unwrap();
        assert_eq!(policy.max_allowed(3, 1), dec!(600));
        assert_eq!(policy.max_allowed(3, 40), dec!(600));
    }

    #[test]
    fn test_zero_days_is_zero_budget() {
        let policy = LimitPolicy::person_based(dec!(150)).unwrap();
        assert_eq!(policy.max_allowed(0, 4), Decimal::ZERO);
        assert_eq!(policy.max_allowed(-2, 4), Decimal::ZERO);
    }

    #[test]
    fn test_non_positive_value_rejected() {
        assert!(matches!(
            LimitPolicy::person_based(dec!(0)),
            Err(MeteringError::InvalidLimitValue(_))
        ));
        assert!(matches!(
            LimitPolicy::household_based(dec!(-10)),
            Err(MeteringError::InvalidLimitValue(_))
        ));
    }

    #[test]
    fn test_unknown_type_fails_fast() {
        let config = LimitRuleConfig {
            rule_type: "PER_HECTARE".to_string(),
            value: dec!(10),
        };
        let result = LimitPolicy::try_from(&config);
        assert!(matches!(result, Err(MeteringError::UnknownLimitRuleType(t)) if t == "PER_HECTARE"));
    }

    #[test]
    fn test_config_round_trip_through_json() {
        let json = r#"{"type":"HOUSEHOLD_BASED","value":"250"}"#;
        let config: LimitRuleConfig = serde_json::from_str(json).unwrap();
        let policy = LimitPolicy::try_from(&config).unwrap();
        assert_eq!(policy, LimitPolicy::HouseholdBased(dec!(250)));
    }

    #[test]
    fn test_policy_book_lookup() {
        let mut book = PolicyBook::new();
        let policy = LimitPolicy::person_based(dec!(150)).unwrap();
        book.assign("zone-north", policy).unwrap();

        assert_eq!(book.policy_for_zone("zone-north").unwrap(), policy);
        assert!(matches!(
            book.policy_for_zone("zone-west"),
            Err(MeteringError::PolicyNotFound { .. })
        ));
        assert!(book.assign("zone-north", policy).is_err());
    }
}
