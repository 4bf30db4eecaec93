// End-to-end scenarios against a file-backed store

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;
use water_metering::db;
use water_metering::{
    import_readings, open_database, LimitPolicy, MeasurementUnit, MeteringEngine, MeteringError,
    NewAccount, PolicyBook, ReadingRow, WaterMeter, WaterPoint,
};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

struct Fixture {
    _dir: TempDir,
    db_path: String,
    policies: Arc<PolicyBook>,
    engine: MeteringEngine,
    point: WaterPoint,
    meter: WaterMeter,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("water.db").to_string_lossy().to_string();

    let mut book = PolicyBook::new();
    book.assign("zone-north", LimitPolicy::person_based(dec!(150)).unwrap())
        .unwrap();
    let policies = Arc::new(book);

    let conn = open_database(&db_path, BUSY_TIMEOUT).unwrap();
    let mut engine = MeteringEngine::new(conn, policies.clone());

    let point = engine
        .create_water_point(WaterPoint::new("zone-north".to_string(), "CAT-001".to_string(), 4, 0))
        .unwrap();
    let account = engine
        .create_account(NewAccount {
            holder_name: "Marta Ruiz".to_string(),
            national_id: "12345678Z".to_string(),
            notes: None,
        })
        .unwrap();
    let meter = engine
        .create_meter("Main", MeasurementUnit::Liters, &account.id, &point.id)
        .unwrap();

    Fixture {
        _dir: dir,
        db_path,
        policies,
        engine,
        point,
        meter,
    }
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

fn meter_count(f: &Fixture) -> usize {
    db::list_meters(f.engine.connection(), Some(&f.point.id)).unwrap().len()
}

#[test]
fn test_ten_day_window_within_limit() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "10000", day(1), None).unwrap();
    f.engine.add_reading(&f.meter.id, "10800", day(11), None).unwrap();

    assert_eq!(f.engine.recalculate_excess(&f.meter.id).unwrap(), Some(false));
}

#[test]
fn test_one_day_spike_is_excess() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "10000", day(1), None).unwrap();
    f.engine.add_reading(&f.meter.id, "16000", day(2), None).unwrap();

    let meter = f.engine.get_meter(&f.meter.id).unwrap();
    assert_eq!(meter.last_reading_excess_consumption, Some(true));
    assert_eq!(f.engine.recalculate_excess(&f.meter.id).unwrap(), Some(true));
}

#[test]
fn test_too_few_readings_stay_unknown() {
    let mut f = fixture();
    assert_eq!(f.engine.recalculate_excess(&f.meter.id).unwrap(), None);

    f.engine.add_reading(&f.meter.id, "10000", day(1), None).unwrap();
    assert_eq!(f.engine.recalculate_excess(&f.meter.id).unwrap(), None);
}

#[test]
fn test_replacement_with_low_final_reading_rolls_back() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "5000", day(1), None).unwrap();
    let before = meter_count(&f);

    let err = f
        .engine
        .replace_meter(&f.meter.id, "Main v2", MeasurementUnit::CubicMeters, Some("4999"), Some(day(5)))
        .unwrap_err();
    assert!(matches!(err, MeteringError::NonMonotonicReading { .. }));

    let old = f.engine.get_meter(&f.meter.id).unwrap();
    assert!(old.is_active);
    assert_eq!(old.replaced_by_id, None);
    assert_eq!(meter_count(&f), before);
    assert_eq!(f.engine.readings(&f.meter.id).unwrap().len(), 1);
}

#[test]
fn test_replacement_without_final_reading() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "5000", day(1), None).unwrap();
    f.engine.add_reading(&f.meter.id, "5200", day(3), None).unwrap();
    let before = meter_count(&f);

    let outcome = f
        .engine
        .replace_meter(&f.meter.id, "Main v2", MeasurementUnit::CubicMeters, None, Some(day(4)))
        .unwrap();
    assert!(!outcome.final_reading_created);
    assert_eq!(meter_count(&f), before + 1);

    let old = f.engine.get_meter(&f.meter.id).unwrap();
    assert!(!old.is_active);
    assert_eq!(old.replaced_by_id.as_deref(), Some(outcome.new_meter_id.as_str()));
    assert_eq!(old.replaced_at, Some(day(4)));
    assert_eq!(f.engine.readings(&f.meter.id).unwrap().len(), 2);

    let new = f.engine.get_meter(&outcome.new_meter_id).unwrap();
    assert!(new.is_active);
    assert_eq!(new.unit, MeasurementUnit::CubicMeters);
    assert_eq!(new.account_id, old.account_id);
    assert_eq!(new.water_point_id, old.water_point_id);
    assert_eq!(new.last_reading_normalized_value, None);
    assert_eq!(new.last_reading_excess_consumption, None);
    assert!(f.engine.readings(&new.id).unwrap().is_empty());
}

#[test]
fn test_replacement_with_final_reading() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "5000", day(1), None).unwrap();

    let outcome = f
        .engine
        .replace_meter(&f.meter.id, "Main v2", MeasurementUnit::Liters, Some("5.400"), Some(day(6)))
        .unwrap();
    assert!(outcome.final_reading_created);

    let history = f.engine.readings(&f.meter.id).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].normalized_reading, dec!(5400));
    assert_eq!(history[1].reading_date, day(6));

    let old = f.engine.get_meter(&f.meter.id).unwrap();
    assert_eq!(old.last_reading_normalized_value, Some(dec!(5400)));
}

#[test]
fn test_closed_meter_rejects_readings() {
    let mut f = fixture();
    f.engine
        .replace_meter(&f.meter.id, "Main v2", MeasurementUnit::Liters, None, None)
        .unwrap();

    let err = f.engine.add_reading(&f.meter.id, "100", day(2), None).unwrap_err();
    assert!(matches!(err, MeteringError::MeterInactive(_)));
    assert!(f.engine.readings(&f.meter.id).unwrap().is_empty());
}

#[test]
fn test_change_owner_variants() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "100", day(1), None).unwrap();

    let other = f
        .engine
        .create_account(NewAccount {
            holder_name: "Jon Etxeberria".to_string(),
            national_id: "87654321X".to_string(),
            notes: None,
        })
        .unwrap();

    let meter = f.engine.change_owner(&f.meter.id, Some(&other.id), None).unwrap();
    assert_eq!(meter.account_id, other.id);

    let meter = f
        .engine
        .change_owner(
            &f.meter.id,
            None,
            Some(NewAccount {
                holder_name: "Nerea Gil".to_string(),
                national_id: "11223344B".to_string(),
                notes: Some("bought the house".to_string()),
            }),
        )
        .unwrap();
    assert_ne!(meter.account_id, other.id);
    assert_eq!(meter.unit, MeasurementUnit::Liters);
    assert_eq!(meter.water_point_id, f.point.id);
    assert_eq!(f.engine.readings(&f.meter.id).unwrap().len(), 1);

    let err = f
        .engine
        .change_owner(
            &f.meter.id,
            None,
            Some(NewAccount {
                holder_name: "Nobody".to_string(),
                national_id: String::new(),
                notes: None,
            }),
        )
        .unwrap_err();
    assert!(matches!(err, MeteringError::AccountDataIncomplete));

    let err = f.engine.change_owner(&f.meter.id, Some("ghost"), None).unwrap_err();
    assert!(matches!(err, MeteringError::AccountNotFound(_)));
    assert_eq!(f.engine.get_meter(&f.meter.id).unwrap().account_id, meter.account_id);
}

#[test]
fn test_concurrent_writers_keep_history_monotonic() {
    let f = fixture();
    let base = day(1);
    let rounds: i64 = 25;

    let handles: Vec<_> = (0..2i64)
        .map(|writer| {
            let db_path = f.db_path.clone();
            let policies = f.policies.clone();
            let meter_id = f.meter.id.clone();

            thread::spawn(move || {
                let conn = db::connect(&db_path, BUSY_TIMEOUT).unwrap();
                let mut engine = MeteringEngine::new(conn, policies).with_actor("writer");
                let mut accepted = 0usize;

                for k in 0..rounds {
                    let value = (k * 10 + writer).to_string();
                    let date = base + Duration::minutes(k * 2 + writer);
                    match engine.add_reading(&meter_id, &value, date, None) {
                        Ok(_) => accepted += 1,
                        Err(MeteringError::NonMonotonicReading { .. })
                        | Err(MeteringError::BackdatedReading { .. }) => {}
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                accepted
            })
        })
        .collect();

    let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    let history = f.engine.readings(&f.meter.id).unwrap();
    assert_eq!(history.len(), accepted);
    assert!(history
        .windows(2)
        .all(|pair| pair[0].normalized_reading <= pair[1].normalized_reading));

    let meter = f.engine.get_meter(&f.meter.id).unwrap();
    assert_eq!(
        meter.last_reading_normalized_value,
        history.last().map(|r| r.normalized_reading)
    );
}

#[test]
fn test_same_row_from_two_engines_is_stored_once() {
    let f = fixture();
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let db_path = f.db_path.clone();
            let policies = f.policies.clone();
            let meter_id = f.meter.id.clone();
            let barrier = barrier.clone();

            thread::spawn(move || {
                let conn = db::connect(&db_path, BUSY_TIMEOUT).unwrap();
                let mut engine = MeteringEngine::new(conn, policies).with_actor("importer");
                let rows = vec![ReadingRow {
                    meter_id,
                    date: "2024-01-05".to_string(),
                    value: "1.250".to_string(),
                    notes: None,
                }];

                barrier.wait();
                import_readings(&mut engine, &rows).unwrap()
            })
        })
        .collect();

    let summaries: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let inserted: usize = summaries.iter().map(|s| s.inserted).sum();
    let duplicates: usize = summaries.iter().map(|s| s.duplicates).sum();
    assert_eq!(inserted, 1);
    assert_eq!(duplicates, 1);
    assert!(summaries.iter().all(|s| s.rejected.is_empty()));

    let history = f.engine.readings(&f.meter.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].normalized_reading, dec!(1250));
}

#[test]
fn test_resubmission_after_commit_is_refused() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "700", day(3), None).unwrap();

    let conn = db::connect(&f.db_path, BUSY_TIMEOUT).unwrap();
    let mut other = MeteringEngine::new(conn, f.policies.clone());
    let err = other.add_reading(&f.meter.id, "700", day(3), None).unwrap_err();
    assert!(matches!(err, MeteringError::DuplicateReading { .. }));

    assert_eq!(f.engine.readings(&f.meter.id).unwrap().len(), 1);
}

#[test]
fn test_backdated_reading_keeps_history_forward() {
    let mut f = fixture();
    f.engine.add_reading(&f.meter.id, "1000", day(10), None).unwrap();

    let err = f.engine.add_reading(&f.meter.id, "5000", day(1), None).unwrap_err();
    assert!(matches!(err, MeteringError::BackdatedReading { .. }));

    let err = f
        .engine
        .replace_meter(&f.meter.id, "Main v2", MeasurementUnit::Liters, Some("1200"), Some(day(9)))
        .unwrap_err();
    assert!(matches!(err, MeteringError::BackdatedReading { .. }));
    assert!(f.engine.get_meter(&f.meter.id).unwrap().is_active);
    assert_eq!(f.engine.readings(&f.meter.id).unwrap().len(), 1);
}
