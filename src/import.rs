// 📥 Bulk Reading Import - CSV sheets collected on meter rounds
//
// Columns: meter_id,date,value,notes
// Every row goes through the same add_reading path as a single submission.
// Re-importing a sheet is harmless: rows already stored are refused by hash
// inside the insert transaction and counted as duplicates.

use crate::engine::MeteringEngine;
use crate::error::{ErrorKind, MeteringError, Result};
use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReadingRow {
    pub meter_id: String,
    pub date: String,
    pub value: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub inserted: usize,
    pub duplicates: usize,
    /// (1-based data line, reason)
    pub rejected: Vec<(usize, String)>,
}

pub fn load_readings_csv(csv_path: &Path) -> anyhow::Result<Vec<ReadingRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        let row: ReadingRow = result.context("Failed to deserialize reading row")?;
        rows.push(row);
    }

    Ok(rows)
}

/// Accepts RFC 3339, `YYYY-MM-DD` or `DD/MM/YYYY` (dates are taken at 00:00 UTC).
pub fn parse_reading_date(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(raw, "%d/%m/%Y"))
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| MeteringError::invalid_reading(raw, "unrecognised reading date"))
}

/// Submit rows one by one. Rejected rows are reported, storage failures abort.
pub fn import_readings(engine: &mut MeteringEngine, rows: &[ReadingRow]) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();

    for (index, row) in rows.iter().enumerate() {
        let line = index + 1;

        let date = match parse_reading_date(&row.date) {
            Ok(date) => date,
            Err(e) => {
                summary.rejected.push((line, e.to_string()));
                continue;
            }
        };

        match engine.add_reading(&row.meter_id, &row.value, date, row.notes.clone()) {
            Ok(_) => summary.inserted += 1,
            Err(MeteringError::DuplicateReading { .. }) => summary.duplicates += 1,
            Err(e) if e.kind() == ErrorKind::Internal => return Err(e),
            Err(e) => {
                warn!(line, meter_id = %row.meter_id, error = %e, "import row rejected");
                summary.rejected.push((line, e.to_string()));
            }
        }
    }

    info!(
        inserted = summary.inserted,
        duplicates = summary.duplicates,
        rejected = summary.rejected.len(),
        "reading import finished"
    );
    Ok(summary)
}
