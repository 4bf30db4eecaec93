// Water Metering Engine - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod error;
pub mod logger;
pub mod config;
pub mod units;          // Unit Normalizer
pub mod limits;         // Limit Policy
pub mod entities;       // Points, accounts, meters, readings
pub mod sequencer;      // Reading Sequencer
pub mod consumption;    // Consumption Calculator
pub mod excess;         // Excess Classifier
pub mod db;
pub mod engine;         // Meter Lifecycle Manager + transactional entry points
pub mod import;

// Re-export commonly used types
pub use error::{ErrorKind, MeteringError, Result};
pub use config::{AppConfig, CommunityConfig};
pub use units::{normalize, normalize_raw, parse_locale_decimal, MeasurementUnit};
pub use limits::{LimitPolicy, LimitRuleConfig, PolicyBook};
pub use entities::{NewAccount, WaterAccount, WaterMeter, WaterMeterReading, WaterPoint};
pub use consumption::Consumption;
pub use excess::{classify, ExcessStatus, MeterCache};
pub use db::{open_database, setup_database, Event};
pub use engine::{
    ConsumptionReport, MeterListing, MeteringEngine, OwnerChange, ReadingCorrection,
    ReplacementOutcome,
};
pub use import::{import_readings, load_readings_csv, ImportSummary, ReadingRow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
