use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::entities::{WaterAccount, WaterMeter, WaterMeterReading, WaterPoint};
use crate::error::{MeteringError, Result};
use crate::units::MeasurementUnit;

/// Event for audit trail ("Every change is an event")
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Open a file-backed store, creating the schema if needed.
pub fn open_database(path: &str, busy_timeout: Duration) -> Result<Connection> {
    let conn = connect(path, busy_timeout)?;
    setup_database(&conn)?;
    Ok(conn)
}

/// Request-scoped connection to an initialized store. The busy timeout makes
/// concurrent writers wait for each other instead of failing.
pub fn connect(path: &str, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Water points
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS water_points (
            id TEXT PRIMARY KEY,
            fixed_population INTEGER NOT NULL CHECK (fixed_population >= 0),
            floating_population INTEGER NOT NULL CHECK (floating_population >= 0),
            zone_id TEXT NOT NULL,
            cadastral_reference TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS water_point_deposits (
            water_point_id TEXT NOT NULL REFERENCES water_points(id),
            deposit_id TEXT NOT NULL,
            PRIMARY KEY (water_point_id, deposit_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Accounts
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS water_accounts (
            id TEXT PRIMARY KEY,
            holder_name TEXT NOT NULL,
            national_id TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Meters (last_reading_* columns are a cache over water_meter_readings)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS water_meters (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            unit TEXT NOT NULL CHECK (unit IN ('L', 'M3')),
            is_active INTEGER NOT NULL,
            account_id TEXT NOT NULL REFERENCES water_accounts(id),
            water_point_id TEXT NOT NULL REFERENCES water_points(id),
            last_reading_normalized_value TEXT,
            last_reading_date TEXT,
            last_reading_excess_consumption INTEGER,
            replaced_by_id TEXT,
            replaced_at TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Readings (row_id keeps creation order for same-date ties)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS water_meter_readings (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT UNIQUE NOT NULL,
            meter_id TEXT NOT NULL REFERENCES water_meters(id),
            reading TEXT NOT NULL,
            normalized_reading TEXT NOT NULL,
            reading_date TEXT NOT NULL,
            notes TEXT,
            image_ref TEXT,
            idempotency_hash TEXT UNIQUE NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_readings_meter ON water_meter_readings(meter_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_meters_point ON water_meters(water_point_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// Column helpers
// ============================================================================

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_datetime(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", value, e)))
}

fn datetime_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let value: String = row.get(idx)?;
    parse_datetime(idx, &value)
}

fn optional_datetime_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_datetime(idx, &v)).transpose()
}

fn parse_decimal(idx: usize, value: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| conversion_error(idx, format!("bad decimal '{}': {}", value, e)))
}

fn decimal_column(row: &Row, idx: usize) -> rusqlite::Result<Decimal> {
    let value: String = row.get(idx)?;
    parse_decimal(idx, &value)
}

fn optional_decimal_column(row: &Row, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let value: Option<String> = row.get(idx)?;
    value.map(|v| parse_decimal(idx, &v)).transpose()
}

fn unit_column(row: &Row, idx: usize) -> rusqlite::Result<MeasurementUnit> {
    let value: String = row.get(idx)?;
    MeasurementUnit::from_str(&value).map_err(|e| conversion_error(idx, e.to_string()))
}

// ============================================================================
// Water points
// ============================================================================

pub fn insert_water_point(conn: &Connection, point: &WaterPoint) -> Result<()> {
    conn.execute(
        "INSERT INTO water_points (
            id, fixed_population, floating_population, zone_id,
            cadastral_reference, notes, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            point.id,
            point.fixed_population,
            point.floating_population,
            point.zone_id,
            point.cadastral_reference,
            point.notes,
            point.created_at.to_rfc3339(),
        ],
    )?;

    for deposit_id in &point.deposit_ids {
        conn.execute(
            "INSERT OR IGNORE INTO water_point_deposits (water_point_id, deposit_id) VALUES (?1, ?2)",
            params![point.id, deposit_id],
        )?;
    }

    Ok(())
}

pub fn get_water_point(conn: &Connection, id: &str) -> Result<Option<WaterPoint>> {
    let point = conn
        .query_row(
            "SELECT id, fixed_population, floating_population, zone_id,
                    cadastral_reference, notes, created_at
             FROM water_points WHERE id = ?1",
            [id],
            |row| {
                Ok(WaterPoint {
                    id: row.get(0)?,
                    fixed_population: row.get(1)?,
                    floating_population: row.get(2)?,
                    zone_id: row.get(3)?,
                    deposit_ids: Vec::new(),
                    cadastral_reference: row.get(4)?,
                    notes: row.get(5)?,
                    created_at: datetime_column(row, 6)?,
                })
            },
        )
        .optional()?;

    let Some(mut point) = point else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT deposit_id FROM water_point_deposits WHERE water_point_id = ?1 ORDER BY deposit_id",
    )?;
    point.deposit_ids = stmt
        .query_map([id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(Some(point))
}

pub fn update_water_point_population(
    conn: &Connection,
    id: &str,
    fixed_population: u32,
    floating_population: u32,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE water_points SET fixed_population = ?1, floating_population = ?2 WHERE id = ?3",
        params![fixed_population, floating_population, id],
    )?;
    Ok(updated)
}

// ============================================================================
// Accounts
// ============================================================================

pub fn insert_account(conn: &Connection, account: &WaterAccount) -> Result<()> {
    conn.execute(
        "INSERT INTO water_accounts (id, holder_name, national_id, notes, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            account.id,
            account.holder_name,
            account.national_id,
            account.notes,
            account.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

pub fn get_account(conn: &Connection, id: &str) -> Result<Option<WaterAccount>> {
    let account = conn
        .query_row(
            "SELECT id, holder_name, national_id, notes, created_at
             FROM water_accounts WHERE id = ?1",
            [id],
            |row| {
                Ok(WaterAccount {
                    id: row.get(0)?,
                    holder_name: row.get(1)?,
                    national_id: row.get(2)?,
                    notes: row.get(3)?,
                    created_at: datetime_column(row, 4)?,
                })
            },
        )
        .optional()?;
    Ok(account)
}

// ============================================================================
// Meters
// ============================================================================

const METER_COLUMNS: &str = "id, name, unit, is_active, account_id, water_point_id,
    last_reading_normalized_value, last_reading_date, last_reading_excess_consumption,
    replaced_by_id, replaced_at, created_at";

fn meter_from_row(row: &Row) -> rusqlite::Result<WaterMeter> {
    Ok(WaterMeter {
        id: row.get(0)?,
        name: row.get(1)?,
        unit: unit_column(row, 2)?,
        is_active: row.get(3)?,
        account_id: row.get(4)?,
        water_point_id: row.get(5)?,
        last_reading_normalized_value: optional_decimal_column(row, 6)?,
        last_reading_date: optional_datetime_column(row, 7)?,
        last_reading_excess_consumption: row.get(8)?,
        replaced_by_id: row.get(9)?,
        replaced_at: optional_datetime_column(row, 10)?,
        created_at: datetime_column(row, 11)?,
    })
}

pub fn insert_meter(conn: &Connection, meter: &WaterMeter) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO water_meters ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            METER_COLUMNS
        ),
        params![
            meter.id,
            meter.name,
            meter.unit.as_str(),
            meter.is_active,
            meter.account_id,
            meter.water_point_id,
            meter.last_reading_normalized_value.map(|v| v.to_string()),
            meter.last_reading_date.map(|dt| dt.to_rfc3339()),
            meter.last_reading_excess_consumption,
            meter.replaced_by_id,
            meter.replaced_at.map(|dt| dt.to_rfc3339()),
            meter.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Persist every mutable meter field (bindings, lifecycle, cache).
pub fn update_meter(conn: &Connection, meter: &WaterMeter) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE water_meters SET
            name = ?1, unit = ?2, is_active = ?3, account_id = ?4, water_point_id = ?5,
            last_reading_normalized_value = ?6, last_reading_date = ?7,
            last_reading_excess_consumption = ?8, replaced_by_id = ?9, replaced_at = ?10
         WHERE id = ?11",
        params![
            meter.name,
            meter.unit.as_str(),
            meter.is_active,
            meter.account_id,
            meter.water_point_id,
            meter.last_reading_normalized_value.map(|v| v.to_string()),
            meter.last_reading_date.map(|dt| dt.to_rfc3339()),
            meter.last_reading_excess_consumption,
            meter.replaced_by_id,
            meter.replaced_at.map(|dt| dt.to_rfc3339()),
            meter.id,
        ],
    )?;
    Ok(updated)
}

pub fn get_meter(conn: &Connection, id: &str) -> Result<Option<WaterMeter>> {
    let meter = conn
        .query_row(
            &format!("SELECT {} FROM water_meters WHERE id = ?1", METER_COLUMNS),
            [id],
            meter_from_row,
        )
        .optional()?;
    Ok(meter)
}

/// All meters, optionally restricted to one water point, oldest first
pub fn list_meters(conn: &Connection, water_point_id: Option<&str>) -> Result<Vec<WaterMeter>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM water_meters
         WHERE (?1 IS NULL OR water_point_id = ?1)
         ORDER BY created_at, id",
        METER_COLUMNS
    ))?;

    let meters = stmt
        .query_map(params![water_point_id], meter_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(meters)
}

// ============================================================================
// Readings
// ============================================================================

const READING_COLUMNS: &str =
    "id, meter_id, reading, normalized_reading, reading_date, notes, image_ref, created_at";

fn reading_from_row(row: &Row) -> rusqlite::Result<WaterMeterReading> {
    Ok(WaterMeterReading {
        id: row.get(0)?,
        meter_id: row.get(1)?,
        reading: row.get(2)?,
        normalized_reading: decimal_column(row, 3)?,
        reading_date: datetime_column(row, 4)?,
        notes: row.get(5)?,
        image_ref: row.get(6)?,
        created_at: datetime_column(row, 7)?,
    })
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Insert a reading. A second row with the same idempotency hash is refused
/// as [`MeteringError::DuplicateReading`].
pub fn insert_reading(conn: &Connection, reading: &WaterMeterReading) -> Result<()> {
    let inserted = conn.execute(
        "INSERT INTO water_meter_readings (
            id, meter_id, reading, normalized_reading, reading_date,
            notes, image_ref, idempotency_hash, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            reading.id,
            reading.meter_id,
            reading.reading,
            reading.normalized_reading.to_string(),
            reading.reading_date.to_rfc3339(),
            reading.notes,
            reading.image_ref,
            reading.compute_idempotency_hash(),
            reading.created_at.to_rfc3339(),
        ],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(e) if is_unique_violation(&e) => Err(MeteringError::DuplicateReading {
            meter_id: reading.meter_id.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

/// Overwrite the correctable fields of a reading.
pub fn update_reading(conn: &Connection, reading: &WaterMeterReading) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE water_meter_readings
         SET reading = ?1, normalized_reading = ?2, notes = ?3, image_ref = ?4,
             idempotency_hash = ?5
         WHERE id = ?6",
        params![
            reading.reading,
            reading.normalized_reading.to_string(),
            reading.notes,
            reading.image_ref,
            reading.compute_idempotency_hash(),
            reading.id,
        ],
    );

    match updated {
        Ok(n) => Ok(n),
        Err(e) if is_unique_violation(&e) => Err(MeteringError::DuplicateReading {
            meter_id: reading.meter_id.clone(),
        }),
        Err(e) => Err(e.into()),
    }
}

pub fn get_reading(conn: &Connection, id: &str) -> Result<Option<WaterMeterReading>> {
    let reading = conn
        .query_row(
            &format!("SELECT {} FROM water_meter_readings WHERE id = ?1", READING_COLUMNS),
            [id],
            reading_from_row,
        )
        .optional()?;
    Ok(reading)
}

/// Full history of a meter in creation order (not date order).
pub fn readings_for_meter(conn: &Connection, meter_id: &str) -> Result<Vec<WaterMeterReading>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM water_meter_readings WHERE meter_id = ?1 ORDER BY row_id",
        READING_COLUMNS
    ))?;

    let readings = stmt
        .query_map([meter_id], reading_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(readings)
}

pub fn reading_hash_exists(conn: &Connection, hash: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM water_meter_readings WHERE idempotency_hash = ?1)",
        [hash],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn count_readings(conn: &Connection, meter_id: &str) -> Result<i64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM water_meter_readings WHERE meter_id = ?1",
        [meter_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

// ============================================================================
// Events
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Get events for a specific entity, oldest first
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY id",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: datetime_column(row, 1)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|e| conversion_error(5, e.to_string()))?,
                actor: row.get(6)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(events)
}
