// 📈 Consumption Calculator - volume and elapsed days over a reading window
//
// Only the earliest and latest reading of a window enter the arithmetic;
// readings in between are returned for display but do not change the figure.

use crate::entities::WaterMeterReading;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Consumption {
    /// Fewer than two readings
    InsufficientData,

    /// Liters consumed over `days` whole days
    Computed { volume: Decimal, days: i64 },
}

impl Consumption {
    pub fn is_computed(&self) -> bool {
        matches!(self, Consumption::Computed { .. })
    }
}

/// Compute consumption over an already ordered sequence.
///
/// Same-day readings (or a clock running backwards) give `days = 0`, which the
/// limit policy turns into a zero budget.
pub fn compute(ordered: &[WaterMeterReading]) -> Consumption {
    match (ordered.first(), ordered.last()) {
        (Some(first), Some(last)) if ordered.len() >= 2 => between(first, last),
        _ => Consumption::InsufficientData,
    }
}

/// Consumption of the interval closed by the latest reading.
pub fn latest_interval(ordered: &[WaterMeterReading]) -> Consumption {
    let start = ordered.len().saturating_sub(2);
    compute(&ordered[start..])
}

/// Readings dated inside the closed interval `[from, to]` plus their consumption.
pub fn window<'a>(
    ordered: &'a [WaterMeterReading],
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> (Vec<&'a WaterMeterReading>, Consumption) {
    let in_window: Vec<&WaterMeterReading> = ordered
        .iter()
        .filter(|r| from.map_or(true, |f| r.reading_date >= f))
        .filter(|r| to.map_or(true, |t| r.reading_date <= t))
        .collect();

    let consumption = match (in_window.first(), in_window.last()) {
        (Some(first), Some(last)) if in_window.len() >= 2 => between(first, last),
        _ => Consumption::InsufficientData,
    };

    (in_window, consumption)
}

fn between(first: &WaterMeterReading, last: &WaterMeterReading) -> Consumption {
    let days = (last.reading_date - first.reading_date).num_days().max(0);
    let volume = last.normalized_reading - first.normalized_reading;
    Consumption::Computed { volume, days }
}
