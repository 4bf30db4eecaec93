// ⚙️ Configuration - database location and per-community limit rules
//
// Limit rules are validated while the file is loaded; a malformed rule never
// reaches evaluation.

use crate::error::{MeteringError, Result};
use crate::limits::{LimitPolicy, LimitRuleConfig, PolicyBook};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV_VAR: &str = "WATER_METERING_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "water-metering.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub communities: Vec<CommunityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityConfig {
    pub name: String,
    pub zones: Vec<String>,
    pub limit_rule: LimitRuleConfig,
}

fn default_database_path() -> String {
    "water-metering.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

impl AppConfig {
    /// Config file named by `WATER_METERING_CONFIG`, else `water-metering.toml`
    pub fn default_path() -> PathBuf {
        std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate; every community's limit rule must build.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content).map_err(|e| MeteringError::Config {
            message: format!("TOML parsing error: {}", e),
        })?;
        config.policy_book()?;
        Ok(config)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Zone → policy map for every configured community
    pub fn policy_book(&self) -> Result<PolicyBook> {
        let mut book = PolicyBook::new();

        for community in &self.communities {
            if community.zones.is_empty() {
                return Err(MeteringError::Config {
                    message: format!("community '{}' lists no zones", community.name),
                });
            }

            let policy = LimitPolicy::try_from(&community.limit_rule)?;
            for zone in &community.zones {
                book.assign(zone, policy)?;
            }
        }

        Ok(book)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            server: ServerConfig::default(),
            communities: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
database_path = "/tmp/water.db"

[server]
bind = "0.0.0.0:8080"

[[communities]]
name = "Valle Alto"
zones = ["zone-north", "zone-south"]
limit_rule = { type = "PERSON_BASED", value = 150 }

[[communities]]
name = "Los Pinos"
zones = ["zone-pinos"]
limit_rule = { type = "HOUSEHOLD_BASED", value = 450.5 }
"#;

    #[test]
    fn test_load_sample() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.database_path, "/tmp/water.db");
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.busy_timeout(), Duration::from_millis(5000));

        let book = config.policy_book().unwrap();
        assert_eq!(book.len(), 3);
        assert_eq!(
            book.policy_for_zone("zone-south").unwrap(),
            LimitPolicy::PersonBased(dec!(150))
        );
        assert_eq!(
            book.policy_for_zone("zone-pinos").unwrap(),
            LimitPolicy::HouseholdBased(dec!(450.5))
        );
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.database_path, "water-metering.db");
        assert_eq!(config.server.bind, "127.0.0.1:3000");
        assert!(config.policy_book().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_rule_type_rejected_at_load() {
        let content = r#"
[[communities]]
name = "Valle Alto"
zones = ["zone-north"]
limit_rule = { type = "PER_COW", value = 10 }
"#;
        assert!(matches!(
            AppConfig::from_toml_str(content),
            Err(MeteringError::UnknownLimitRuleType(t)) if t == "PER_COW"
        ));
    }

    #[test]
    fn test_non_positive_value_rejected_at_load() {
        let content = r#"
[[communities]]
name = "Valle Alto"
zones = ["zone-north"]
limit_rule = { type = "HOUSEHOLD_BASED", value = 0 }
"#;
        assert!(matches!(
            AppConfig::from_toml_str(content),
            Err(MeteringError::InvalidLimitValue(_))
        ));
    }

    #[test]
    fn test_shared_zone_rejected() {
        let content = r#"
[[communities]]
name = "A"
zones = ["zone-1"]
limit_rule = { type = "HOUSEHOLD_BASED", value = 100 }

[[communities]]
name = "B"
zones = ["zone-1"]
limit_rule = { type = "HOUSEHOLD_BASED", value = 200 }
"#;
        assert!(matches!(
            AppConfig::from_toml_str(content),
            Err(MeteringError::Config { .. })
        ));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(matches!(
            AppConfig::from_toml_str("communities = 3"),
            Err(MeteringError::Config { .. })
        ));
    }
}
