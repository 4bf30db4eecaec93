// Entity Models - water infrastructure records the metering engine works on
//
// Each entity has:
// - Stable identity (UUID) that never changes
// - Values that can be corrected over time (population, holder, bindings)
// - A row in the SQLite store (see db.rs)

pub mod water_point;
pub mod water_account;
pub mod water_meter;
pub mod reading;

pub use water_point::WaterPoint;
pub use water_account::{NewAccount, WaterAccount};
pub use water_meter::WaterMeter;
pub use reading::WaterMeterReading;
