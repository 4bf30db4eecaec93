// ⚙️ Metering Engine - transactional entry points
//
// Every mutation runs inside one BEGIN IMMEDIATE transaction:
//   read meter → validate → write reading/meter → rebuild cache → audit event
// Two writers on the same store serialize on the write lock, and the later one
// validates against what the earlier one committed. Dropping the transaction
// on any error rolls back every step.

use crate::consumption::{self, Consumption};
use crate::db::{self, Event};
use crate::entities::{NewAccount, WaterAccount, WaterMeter, WaterMeterReading, WaterPoint};
use crate::error::{MeteringError, Result};
use crate::excess::{self, ExcessStatus, MeterCache};
use crate::limits::PolicyBook;
use crate::sequencer;
use crate::units::{self, MeasurementUnit};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const DEFAULT_ACTOR: &str = "metering_engine";

// ============================================================================
// OPERATION INPUTS / OUTPUTS
// ============================================================================

/// Target account of an ownership change
#[derive(Debug, Clone)]
pub enum OwnerChange {
    Existing(String),
    New(NewAccount),
}

impl OwnerChange {
    /// An existing account id wins; otherwise complete new-account data is required.
    pub fn from_parts(account_id: Option<&str>, account_data: Option<NewAccount>) -> Result<Self> {
        match (account_id.map(str::trim), account_data) {
            (Some(id), _) if !id.is_empty() => Ok(OwnerChange::Existing(id.to_string())),
            (_, Some(data)) if data.is_complete() => Ok(OwnerChange::New(data)),
            _ => Err(MeteringError::AccountDataIncomplete),
        }
    }
}

/// Result of a meter replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementOutcome {
    pub new_meter_id: String,
    pub final_reading_created: bool,
}

/// Fields of a reading that may still be corrected
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadingCorrection {
    /// New raw value in the meter's unit
    pub value: Option<String>,
    pub notes: Option<String>,
}

/// Consumption over an explicit window, with the readings shown alongside it
#[derive(Debug, Clone, Serialize)]
pub struct ConsumptionReport {
    pub meter_id: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub readings: Vec<WaterMeterReading>,
    pub consumption: Consumption,
    pub max_allowed: Option<Decimal>,
    pub excess: ExcessStatus,
}

/// One row of the meter listing
#[derive(Debug, Clone, Serialize)]
pub struct MeterListing {
    pub meter: WaterMeter,
    pub excess: ExcessStatus,
}

// ============================================================================
// ENGINE
// ============================================================================

pub struct MeteringEngine {
    conn: Connection,
    policies: Arc<PolicyBook>,
    actor: String,
}

impl MeteringEngine {
    /// Wrap an already prepared connection (see [`db::setup_database`]).
    pub fn new(conn: Connection, policies: Arc<PolicyBook>) -> Self {
        MeteringEngine {
            conn,
            policies,
            actor: DEFAULT_ACTOR.to_string(),
        }
    }

    /// Name recorded in the audit trail for this engine's mutations
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn policies(&self) -> &PolicyBook {
        &self.policies
    }

    // ------------------------------------------------------------------------
    // Pairing setup
    // ------------------------------------------------------------------------

    pub fn create_water_point(&mut self, point: WaterPoint) -> Result<WaterPoint> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        db::insert_water_point(&tx, &point)?;
        record(&tx, &self.actor, "point_created", "water_point", &point.id, serde_json::json!({
            "zone_id": point.zone_id,
            "population": point.population(),
        }))?;
        tx.commit()?;

        info!(point_id = %point.id, zone = %point.zone_id, "water point created");
        Ok(point)
    }

    pub fn create_account(&mut self, data: NewAccount) -> Result<WaterAccount> {
        let account = data.into_account()?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        db::insert_account(&tx, &account)?;
        record(&tx, &self.actor, "account_created", "water_account", &account.id, serde_json::json!({
            "holder_name": account.holder_name,
        }))?;
        tx.commit()?;

        info!(account_id = %account.id, "water account created");
        Ok(account)
    }

    /// Establish a point/account pairing with a fresh active meter.
    pub fn create_meter(
        &mut self,
        name: &str,
        unit: MeasurementUnit,
        account_id: &str,
        water_point_id: &str,
    ) -> Result<WaterMeter> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        db::get_account(&tx, account_id)?
            .ok_or_else(|| MeteringError::AccountNotFound(account_id.to_string()))?;
        db::get_water_point(&tx, water_point_id)?
            .ok_or_else(|| MeteringError::PointNotFound(water_point_id.to_string()))?;

        let meter = WaterMeter::new(
            name.to_string(),
            unit,
            account_id.to_string(),
            water_point_id.to_string(),
        );
        db::insert_meter(&tx, &meter)?;
        record(&tx, &self.actor, "meter_created", "water_meter", &meter.id, serde_json::json!({
            "unit": meter.unit.as_str(),
            "account_id": account_id,
            "water_point_id": water_point_id,
        }))?;
        tx.commit()?;

        info!(meter_id = %meter.id, unit = %meter.unit, "water meter created");
        Ok(meter)
    }

    // ------------------------------------------------------------------------
    // Readings
    // ------------------------------------------------------------------------

    /// Record a new reading; `raw` is in the meter's unit and locale format.
    pub fn add_reading(
        &mut self,
        meter_id: &str,
        raw: &str,
        reading_date: DateTime<Utc>,
        notes: Option<String>,
    ) -> Result<WaterMeterReading> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut meter = load_meter(&tx, meter_id)?;
        let reading = WaterMeterReading::new(&meter, raw, reading_date, notes)
            .and_then(|reading| ensure_not_recorded(&tx, &reading).map(|_| reading))
            .and_then(|reading| sequencer::validate_insert(&meter, &reading).map(|_| reading))
            .inspect_err(|e| warn!(meter_id, raw, error = %e, "reading rejected"))?;

        db::insert_reading(&tx, &reading)?;
        refresh_cache(&tx, &self.policies, &mut meter)?;
        record(&tx, &self.actor, "reading_added", "water_meter", &meter.id, serde_json::json!({
            "reading_id": reading.id,
            "reading": reading.reading,
            "normalized_reading": reading.normalized_reading.to_string(),
            "reading_date": reading.reading_date.to_rfc3339(),
        }))?;
        tx.commit()?;

        info!(
            meter_id,
            liters = %reading.normalized_reading,
            excess = ?meter.last_reading_excess_consumption,
            "reading added"
        );
        Ok(reading)
    }

    /// Correct value and/or notes of one of the two most recent readings.
    pub fn correct_reading(
        &mut self,
        reading_id: &str,
        correction: ReadingCorrection,
    ) -> Result<WaterMeterReading> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut reading = db::get_reading(&tx, reading_id)?
            .ok_or_else(|| MeteringError::ReadingNotFound(reading_id.to_string()))?;
        let mut meter = load_meter(&tx, &reading.meter_id)?;
        let ordered = sequencer::order(db::readings_for_meter(&tx, &meter.id)?);

        if !meter.is_active || !sequencer::is_editable(&ordered, reading_id) {
            return Err(MeteringError::ReadingNotEditable(reading_id.to_string()));
        }

        let previous = reading.reading.clone();
        if let Some(raw) = correction.value.as_deref() {
            let normalized = units::normalize_raw(raw, meter.unit)?;
            sequencer::validate_correction(&ordered, reading_id, normalized)?;
            reading.reading = raw.trim().to_string();
            reading.normalized_reading = normalized;
        }
        if let Some(notes) = correction.notes {
            reading.notes = Some(notes);
        }

        db::update_reading(&tx, &reading)?;
        refresh_cache(&tx, &self.policies, &mut meter)?;
        record(&tx, &self.actor, "reading_corrected", "water_meter", &meter.id, serde_json::json!({
            "reading_id": reading.id,
            "previous": previous,
            "reading": reading.reading,
        }))?;
        tx.commit()?;

        info!(reading_id, meter_id = %meter.id, "reading corrected");
        Ok(reading)
    }

    /// Attach a photo of the dial to any reading. Values are untouched.
    pub fn attach_image(&mut self, reading_id: &str, image_ref: &str) -> Result<WaterMeterReading> {
        let image_ref = image_ref.trim();
        if image_ref.is_empty() {
            return Err(MeteringError::invalid_reading(reading_id, "empty image reference"));
        }

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let reading = db::get_reading(&tx, reading_id)?
            .ok_or_else(|| MeteringError::ReadingNotFound(reading_id.to_string()))?
            .with_image(image_ref.to_string());

        db::update_reading(&tx, &reading)?;
        record(&tx, &self.actor, "reading_image_attached", "water_meter", &reading.meter_id, serde_json::json!({
            "reading_id": reading.id,
            "image_ref": image_ref,
        }))?;
        tx.commit()?;

        info!(reading_id, "reading image attached");
        Ok(reading)
    }

    /// Readings of a meter in chronological order
    pub fn readings(&self, meter_id: &str) -> Result<Vec<WaterMeterReading>> {
        load_meter(&self.conn, meter_id)?;
        Ok(sequencer::order(db::readings_for_meter(&self.conn, meter_id)?))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Close `old_meter_id` (optionally with a final reading in its own unit)
    /// and open its successor on the same account and point, all or nothing.
    pub fn replace_meter(
        &mut self,
        old_meter_id: &str,
        new_name: &str,
        new_unit: MeasurementUnit,
        final_reading: Option<&str>,
        replacement_date: Option<DateTime<Utc>>,
    ) -> Result<ReplacementOutcome> {
        let replaced_at = replacement_date.unwrap_or_else(Utc::now);

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut old = load_meter(&tx, old_meter_id)?;
        if !old.is_active {
            return Err(MeteringError::MeterInactive(old.id.clone()));
        }
        // Successor is classified under the same point, with or without a final reading
        let point = load_point(&tx, &old.water_point_id)?;
        self.policies.policy_for_zone(&point.zone_id)?;

        let mut final_reading_created = false;
        if let Some(raw) = final_reading {
            let reading = WaterMeterReading::new(&old, raw, replaced_at, Some("final reading".to_string()))
                .and_then(|reading| sequencer::validate_insert(&old, &reading).map(|_| reading))
                .inspect_err(|e| warn!(meter_id = old_meter_id, raw, error = %e, "final reading rejected"))?;
            db::insert_reading(&tx, &reading)?;
            refresh_cache(&tx, &self.policies, &mut old)?;
            final_reading_created = true;
        }

        let successor = old.successor(new_name.to_string(), new_unit);
        old.close(&successor.id, replaced_at);

        db::update_meter(&tx, &old)?;
        db::insert_meter(&tx, &successor)?;
        record(&tx, &self.actor, "meter_replaced", "water_meter", &old.id, serde_json::json!({
            "successor_id": successor.id,
            "final_reading_created": final_reading_created,
            "replaced_at": replaced_at.to_rfc3339(),
        }))?;
        record(&tx, &self.actor, "meter_created", "water_meter", &successor.id, serde_json::json!({
            "unit": successor.unit.as_str(),
            "predecessor_id": old.id,
        }))?;
        tx.commit()?;

        info!(old_meter_id, new_meter_id = %successor.id, final_reading_created, "meter replaced");
        Ok(ReplacementOutcome {
            new_meter_id: successor.id,
            final_reading_created,
        })
    }

    /// Rebind a meter to another account. Readings, point and unit are untouched.
    pub fn change_owner(
        &mut self,
        meter_id: &str,
        new_account_id: Option<&str>,
        new_account_data: Option<NewAccount>,
    ) -> Result<WaterMeter> {
        let change = OwnerChange::from_parts(new_account_id, new_account_data)?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut meter = load_meter(&tx, meter_id)?;
        let account = match change {
            OwnerChange::Existing(id) => {
                db::get_account(&tx, &id)?.ok_or(MeteringError::AccountNotFound(id))?
            }
            OwnerChange::New(data) => {
                let account = data.into_account()?;
                db::insert_account(&tx, &account)?;
                account
            }
        };

        let previous_account_id = std::mem::replace(&mut meter.account_id, account.id.clone());
        db::update_meter(&tx, &meter)?;
        record(&tx, &self.actor, "owner_changed", "water_meter", &meter.id, serde_json::json!({
            "previous_account_id": previous_account_id,
            "account_id": account.id,
        }))?;
        tx.commit()?;

        info!(meter_id, account_id = %account.id, "meter owner changed");
        Ok(meter)
    }

    /// Successor chain starting at `meter_id`, ending at the meter still in service.
    pub fn meter_lineage(&self, meter_id: &str) -> Result<Vec<WaterMeter>> {
        let mut lineage = vec![load_meter(&self.conn, meter_id)?];
        let mut seen: HashSet<String> = HashSet::from([meter_id.to_string()]);

        while let Some(next_id) = lineage.last().and_then(|m| m.replaced_by_id.clone()) {
            if !seen.insert(next_id.clone()) {
                break;
            }
            lineage.push(load_meter(&self.conn, &next_id)?);
        }

        Ok(lineage)
    }

    // ------------------------------------------------------------------------
    // Excess cache
    // ------------------------------------------------------------------------

    /// Rebuild a meter's cached last-reading fields. Safe to re-run.
    pub fn recalculate_excess(&mut self, meter_id: &str) -> Result<Option<bool>> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut meter = load_meter(&tx, meter_id)?;
        let before = meter.last_reading_excess_consumption;
        refresh_cache(&tx, &self.policies, &mut meter)?;

        if before != meter.last_reading_excess_consumption {
            record(&tx, &self.actor, "excess_recalculated", "water_meter", &meter.id, serde_json::json!({
                "before": before,
                "after": meter.last_reading_excess_consumption,
            }))?;
        }
        tx.commit()?;

        debug!(meter_id, excess = ?meter.last_reading_excess_consumption, "excess recalculated");
        Ok(meter.last_reading_excess_consumption)
    }

    /// Recalculate every meter in the store; returns how many were processed.
    pub fn recalculate_all(&mut self) -> Result<usize> {
        let ids: Vec<String> = db::list_meters(&self.conn, None)?
            .into_iter()
            .map(|m| m.id)
            .collect();

        for id in &ids {
            self.recalculate_excess(id)?;
        }

        info!(meters = ids.len(), "excess cache rebuilt");
        Ok(ids.len())
    }

    /// Update a point's population and rebuild the cache of its meters.
    pub fn update_point_population(
        &mut self,
        water_point_id: &str,
        fixed_population: u32,
        floating_population: u32,
    ) -> Result<WaterPoint> {
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut point = db::get_water_point(&tx, water_point_id)?
            .ok_or_else(|| MeteringError::PointNotFound(water_point_id.to_string()))?;
        let previous = point.population();

        db::update_water_point_population(&tx, water_point_id, fixed_population, floating_population)?;
        point.fixed_population = fixed_population;
        point.floating_population = floating_population;

        let meters = db::list_meters(&tx, Some(water_point_id))?;
        for mut meter in meters {
            refresh_cache(&tx, &self.policies, &mut meter)?;
        }

        record(&tx, &self.actor, "point_updated", "water_point", water_point_id, serde_json::json!({
            "previous_population": previous,
            "population": point.population(),
        }))?;
        tx.commit()?;

        info!(water_point_id, population = point.population(), "water point population updated");
        Ok(point)
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    pub fn get_meter(&self, meter_id: &str) -> Result<WaterMeter> {
        load_meter(&self.conn, meter_id)
    }

    pub fn list_meters(&self, water_point_id: Option<&str>) -> Result<Vec<MeterListing>> {
        let listings = db::list_meters(&self.conn, water_point_id)?
            .into_iter()
            .map(|meter| MeterListing {
                excess: meter.excess_status(),
                meter,
            })
            .collect();
        Ok(listings)
    }

    /// Consumption over `[from, to]` (either bound optional), classified
    /// against the point's current policy and population.
    pub fn consumption_report(
        &self,
        meter_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<ConsumptionReport> {
        let meter = load_meter(&self.conn, meter_id)?;
        let point = load_point(&self.conn, &meter.water_point_id)?;
        let policy = self.policies.policy_for_zone(&point.zone_id)?;

        let ordered = sequencer::order(db::readings_for_meter(&self.conn, meter_id)?);
        let (in_window, consumption) = consumption::window(&ordered, from, to);

        let max_allowed = match consumption {
            Consumption::Computed { days, .. } => Some(policy.max_allowed(days, point.population())),
            Consumption::InsufficientData => None,
        };
        let excess = ExcessStatus::from(excess::classify(&consumption, &policy, point.population()));

        Ok(ConsumptionReport {
            meter_id: meter.id,
            from,
            to,
            readings: in_window.into_iter().cloned().collect(),
            consumption,
            max_allowed,
            excess,
        })
    }
}

// ============================================================================
// HELPERS (run against a connection or an open transaction)
// ============================================================================

fn load_meter(conn: &Connection, meter_id: &str) -> Result<WaterMeter> {
    db::get_meter(conn, meter_id)?.ok_or_else(|| MeteringError::MeterNotFound(meter_id.to_string()))
}

fn load_point(conn: &Connection, point_id: &str) -> Result<WaterPoint> {
    db::get_water_point(conn, point_id)?
        .ok_or_else(|| MeteringError::PointNotFound(point_id.to_string()))
}

/// Refuse a reading already stored for the meter (same date and raw value).
/// Runs inside the caller's transaction so concurrent resubmissions serialize.
fn ensure_not_recorded(conn: &Connection, reading: &WaterMeterReading) -> Result<()> {
    if db::reading_hash_exists(conn, &reading.compute_idempotency_hash())? {
        return Err(MeteringError::DuplicateReading {
            meter_id: reading.meter_id.clone(),
        });
    }
    Ok(())
}

/// Rebuild and persist the meter's last-reading cache from its full history.
fn refresh_cache(conn: &Connection, policies: &PolicyBook, meter: &mut WaterMeter) -> Result<()> {
    let point = load_point(conn, &meter.water_point_id)?;
    let policy = policies.policy_for_zone(&point.zone_id)?;
    let ordered = sequencer::order(db::readings_for_meter(conn, &meter.id)?);

    let cache = MeterCache::derive(&ordered, &policy, point.population());
    meter.last_reading_normalized_value = cache.last_reading_normalized_value;
    meter.last_reading_date = cache.last_reading_date;
    meter.last_reading_excess_consumption = cache.last_reading_excess_consumption;

    db::update_meter(conn, meter)?;
    Ok(())
}

fn record(
    conn: &Connection,
    actor: &str,
    event_type: &str,
    entity_type: &str,
    entity_id: &str,
    data: serde_json::Value,
) -> Result<()> {
    db::insert_event(conn, &Event::new(event_type, entity_type, entity_id, data, actor))
}
