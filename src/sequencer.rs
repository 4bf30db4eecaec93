// 🧮 Reading Sequencer - chronological order and counter monotonicity
//
// Counters never run backwards except across a meter replacement, so a new
// reading below the meter's last value is an entry error and is rejected.

use crate::entities::{WaterMeter, WaterMeterReading};
use crate::error::{MeteringError, Result};
use rust_decimal::Decimal;

/// Number of trailing readings that may still be corrected
pub const EDITABLE_TAIL: usize = 2;

/// Order readings by date ascending. Same-date readings keep their input
/// (creation) order.
pub fn order(mut readings: Vec<WaterMeterReading>) -> Vec<WaterMeterReading> {
    readings.sort_by_key(|r| r.reading_date);
    readings
}

/// Guard run before a reading is persisted against `meter`.
///
/// New readings only extend the history: the value may not drop below the
/// last one and the date may not fall before it. Same-date readings are kept.
pub fn validate_insert(meter: &WaterMeter, candidate: &WaterMeterReading) -> Result<()> {
    if !meter.is_active {
        return Err(MeteringError::MeterInactive(meter.id.clone()));
    }
    validate_against_last(meter, candidate.normalized_reading)?;

    if let Some(last) = meter.last_reading_date {
        if candidate.reading_date < last {
            return Err(MeteringError::BackdatedReading {
                meter_id: meter.id.clone(),
                candidate: candidate.reading_date,
                last,
            });
        }
    }
    Ok(())
}

/// Monotonicity check only; used for a replacement's final reading before the
/// meter is closed.
pub fn validate_against_last(meter: &WaterMeter, candidate: Decimal) -> Result<()> {
    if let Some(last) = meter.last_reading_normalized_value {
        if candidate < last {
            return Err(MeteringError::NonMonotonicReading {
                meter_id: meter.id.clone(),
                candidate,
                last,
            });
        }
    }
    Ok(())
}

/// Whether the reading with `reading_id` is among the trailing editable ones.
pub fn is_editable(ordered: &[WaterMeterReading], reading_id: &str) -> bool {
    let start = ordered.len().saturating_sub(EDITABLE_TAIL);
    ordered[start..].iter().any(|r| r.id == reading_id)
}

/// A corrected value must stay between its neighbours in the ordered history.
pub fn validate_correction(
    ordered: &[WaterMeterReading],
    reading_id: &str,
    new_value: Decimal,
) -> Result<()> {
    let position = ordered
        .iter()
        .position(|r| r.id == reading_id)
        .ok_or_else(|| MeteringError::ReadingNotFound(reading_id.to_string()))?;

    let reading = &ordered[position];

    if let Some(previous) = position.checked_sub(1).map(|i| &ordered[i]) {
        if new_value < previous.normalized_reading {
            return Err(MeteringError::NonMonotonicReading {
                meter_id: reading.meter_id.clone(),
                candidate: new_value,
                last: previous.normalized_reading,
            });
        }
    }

    if let Some(next) = ordered.get(position + 1) {
        if new_value > next.normalized_reading {
            return Err(MeteringError::NonMonotonicReading {
                meter_id: reading.meter_id.clone(),
                candidate: next.normalized_reading,
                last: new_value,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::MeasurementUnit;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn meter() -> WaterMeter {
        WaterMeter::new(
            "Main".to_string(),
            MeasurementUnit::Liters,
            "acc".to_string(),
            "point".to_string(),
        )
    }

    fn reading(meter: &WaterMeter, day: u32, raw: &str) -> WaterMeterReading {
        let date = Utc.with_ymd_and_hms(2024, 1, day, 8, 0, 0).unwrap();
        WaterMeterReading::new(meter, raw, date, None).unwrap()
    }

    #[test]
    fn test_order_by_date() {
        let m = meter();
        let ordered = order(vec![
            reading(&m, 11, "10800"),
            reading(&m, 1, "10000"),
            reading(&m, 5, "10400"),
        ]);
        let values: Vec<Decimal> = ordered.iter().map(|r| r.normalized_reading).collect();
        assert_eq!(values, vec![dec!(10000), dec!(10400), dec!(10800)]);
    }

    #[test]
    fn test_order_is_stable_for_same_date() {
        let m = meter();
        let first = reading(&m, 3, "100");
        let second = reading(&m, 3, "120");
        let ids = vec![first.id.clone(), second.id.clone()];

        let ordered = order(vec![first, second]);
        let ordered_ids: Vec<String> = ordered.into_iter().map(|r| r.id).collect();
        assert_eq!(ordered_ids, ids);
    }

    #[test]
    fn test_backwards_reading_rejected() {
        let mut m = meter();
        m.last_reading_normalized_value = Some(dec!(10800));

        let candidate = reading(&m, 12, "10799");
        let err = validate_insert(&m, &candidate).unwrap_err();
        assert!(matches!(err, MeteringError::NonMonotonicReading { .. }));

        let equal = reading(&m, 12, "10800");
        assert!(validate_insert(&m, &equal).is_ok());
    }

    #[test]
    fn test_earlier_date_rejected_even_with_higher_value() {
        let mut m = meter();
        m.last_reading_normalized_value = Some(dec!(1000));
        m.last_reading_date = Some(Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap());

        let backdated = reading(&m, 1, "5000");
        let err = validate_insert(&m, &backdated).unwrap_err();
        assert!(matches!(err, MeteringError::BackdatedReading { .. }));

        let same_day = reading(&m, 10, "1200");
        assert!(validate_insert(&m, &same_day).is_ok());
    }

    #[test]
    fn test_first_reading_always_accepted() {
        let m = meter();
        assert!(validate_insert(&m, &reading(&m, 1, "0")).is_ok());
    }

    #[test]
    fn test_inactive_meter_rejects_readings() {
        let mut m = meter();
        m.is_active = false;
        let err = validate_insert(&m, &reading(&m, 1, "5")).unwrap_err();
        assert!(matches!(err, MeteringError::MeterInactive(_)));
    }

    #[test]
    fn test_only_tail_is_editable() {
        let m = meter();
        let ordered = order(vec![
            reading(&m, 1, "100"),
            reading(&m, 2, "200"),
            reading(&m, 3, "300"),
        ]);
        assert!(!is_editable(&ordered, &ordered[0].id));
        assert!(is_editable(&ordered, &ordered[1].id));
        assert!(is_editable(&ordered, &ordered[2].id));
    }

    #[test]
    fn test_correction_bounded_by_neighbours() {
        let m = meter();
        let ordered = order(vec![
            reading(&m, 1, "100"),
            reading(&m, 2, "200"),
            reading(&m, 3, "300"),
        ]);
        let middle = ordered[1].id.clone();

        assert!(validate_correction(&ordered, &middle, dec!(250)).is_ok());
        assert!(validate_correction(&ordered, &middle, dec!(99)).is_err());
        assert!(validate_correction(&ordered, &middle, dec!(301)).is_err());

        let last = ordered[2].id.clone();
        assert!(validate_correction(&ordered, &last, dec!(5000)).is_ok());
    }
}
