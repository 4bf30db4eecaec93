use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;
use std::sync::Arc;

use water_metering::import::parse_reading_date;
use water_metering::{
    import_readings, load_readings_csv, logger, open_database, AppConfig, Consumption,
    MeteringEngine,
};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let verbose = args.iter().any(|a| a == "-v" || a == "--verbose");
    let args: Vec<&str> = args
        .iter()
        .skip(1)
        .map(String::as_str)
        .filter(|a| !a.starts_with('-'))
        .collect();

    logger::init_cli_logger(verbose);

    match args.as_slice() {
        ["init"] => run_init(),
        ["import", csv_path] => run_import(Path::new(csv_path)),
        ["recalculate"] => run_recalculate(),
        ["list"] => run_list(None),
        ["list", point_id] => run_list(Some(*point_id)),
        ["report", meter_id, rest @ ..] => run_report(meter_id, rest),
        _ => {
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    println!("water-metering {}", water_metering::VERSION);
    println!();
    println!("Usage:");
    println!("  water-metering init                         create the database");
    println!("  water-metering import <readings.csv>        import meter_id,date,value,notes rows");
    println!("  water-metering recalculate                  rebuild every meter's excess flag");
    println!("  water-metering list [point_id]              list meters and their status");
    println!("  water-metering report <meter_id> [from] [to]");
    println!();
    println!("Config: ${} or ./{}", water_metering::config::CONFIG_ENV_VAR, water_metering::config::DEFAULT_CONFIG_FILE);
}

fn load_config() -> Result<AppConfig> {
    let path = AppConfig::default_path();
    if !path.exists() {
        bail!("Config file not found at {:?}", path);
    }
    AppConfig::from_file(&path).with_context(|| format!("Failed to load config {:?}", path))
}

fn open_engine(config: &AppConfig) -> Result<MeteringEngine> {
    let conn = open_database(&config.database_path, config.busy_timeout())
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    let policies = Arc::new(config.policy_book()?);
    Ok(MeteringEngine::new(conn, policies).with_actor("cli"))
}

fn run_init() -> Result<()> {
    let config = load_config()?;
    open_engine(&config)?;

    println!("✓ Database initialized with WAL mode: {}", config.database_path);
    println!("✓ {} communities configured", config.communities.len());
    Ok(())
}

fn run_import(csv_path: &Path) -> Result<()> {
    let config = load_config()?;
    let mut engine = open_engine(&config)?;

    println!("📂 Loading CSV...");
    let rows = load_readings_csv(csv_path)?;
    println!("✓ Loaded {} rows from CSV", rows.len());

    let summary = import_readings(&mut engine, &rows)?;
    println!("✓ Inserted: {} readings", summary.inserted);
    println!("✓ Skipped duplicates: {}", summary.duplicates);

    if !summary.rejected.is_empty() {
        println!("⚠️  Rejected: {}", summary.rejected.len());
        for (line, reason) in &summary.rejected {
            println!("   line {}: {}", line, reason);
        }
    }

    Ok(())
}

fn run_recalculate() -> Result<()> {
    let config = load_config()?;
    let mut engine = open_engine(&config)?;

    let count = engine.recalculate_all()?;
    println!("✓ Recalculated {} meters", count);
    Ok(())
}

fn run_list(point_id: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let engine = open_engine(&config)?;

    let listings = engine.list_meters(point_id)?;
    println!("{:<38} {:<20} {:<4} {:<8} {:>14} {:<8}", "ID", "NAME", "UNIT", "ACTIVE", "LAST (L)", "STATUS");

    for row in &listings {
        let last = row
            .meter
            .last_reading_normalized_value
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<20} {:<4} {:<8} {:>14} {:<8}",
            row.meter.id,
            row.meter.name,
            row.meter.unit.as_str(),
            if row.meter.is_active { "yes" } else { "no" },
            last,
            row.excess.as_str(),
        );
    }

    println!("\n✓ {} meters", listings.len());
    Ok(())
}

fn run_report(meter_id: &str, bounds: &[&str]) -> Result<()> {
    let config = load_config()?;
    let engine = open_engine(&config)?;

    let from = bounds.first().map(|d| parse_reading_date(d)).transpose()?;
    let to = bounds.get(1).map(|d| parse_reading_date(d)).transpose()?;

    let report = engine.consumption_report(meter_id, from, to)?;

    println!("📊 Meter {}", report.meter_id);
    for reading in &report.readings {
        println!(
            "   {}  {:>12} L  ({})",
            reading.reading_date.format("%Y-%m-%d"),
            reading.normalized_reading,
            reading.reading
        );
    }

    match report.consumption {
        Consumption::InsufficientData => println!("\n   Not enough readings in window"),
        Consumption::Computed { volume, days } => {
            println!("\n   Consumed: {} L over {} days", volume, days);
            if let Some(max) = report.max_allowed {
                println!("   Allowed:  {} L", max);
            }
        }
    }
    println!("   Status:   {}", report.excess.as_str());

    Ok(())
}
