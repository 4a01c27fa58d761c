use std::path::Path;

use tether_core::{EntityId, Resolution};

use crate::cli::{BulkStrategy, Strategy};
use crate::commands::common::{format_conflict_lines, open_engine, open_store, parse_fields, print_json};
use crate::error::CliError;
use crate::settings::Settings;

pub async fn run_conflicts_list(scope: Option<&str>, as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let conflicts = store.conflicts(scope).await?;

    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_detect(scope: &str, as_json: bool, settings: &Settings) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    engine.check_connectivity().await;
    let conflicts = engine.detect_conflicts(scope).await?;

    if as_json {
        return print_json(&conflicts);
    }
    if conflicts.is_empty() {
        println!("No conflicts detected.");
        return Ok(());
    }
    for line in format_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_conflicts_resolve(
    id: &str,
    strategy: Strategy,
    fields: Vec<String>,
    values: Option<&str>,
    settings: &Settings,
) -> Result<(), CliError> {
    let resolution = build_resolution(strategy, fields, values)?;
    let item_id = EntityId::new(id.trim())?;
    let engine = open_engine(settings).await?;
    engine.resolve(&item_id, resolution).await?;
    println!("{item_id}");
    Ok(())
}

pub async fn run_conflicts_resolve_all(
    strategy: BulkStrategy,
    as_json: bool,
    settings: &Settings,
) -> Result<(), CliError> {
    let resolution = match strategy {
        BulkStrategy::KeepLocal => Resolution::KeepLocal,
        BulkStrategy::KeepServer => Resolution::KeepServer,
    };
    let engine = open_engine(settings).await?;
    let report = engine.resolve_all(resolution).await?;

    if as_json {
        return print_json(&report);
    }
    for id in &report.resolved {
        println!("resolved  {id}");
    }
    for (id, error) in &report.failed {
        println!("failed    {id}  {error}");
    }
    println!("{} resolved, {} failed", report.resolved.len(), report.failed.len());
    Ok(())
}

pub fn build_resolution(
    strategy: Strategy,
    fields: Vec<String>,
    values: Option<&str>,
) -> Result<Resolution, CliError> {
    match strategy {
        Strategy::KeepLocal => Ok(Resolution::KeepLocal),
        Strategy::KeepServer => Ok(Resolution::KeepServer),
        Strategy::Merge => {
            let fields: Vec<String> = fields
                .into_iter()
                .map(|field| field.trim().to_string())
                .filter(|field| !field.is_empty())
                .collect();
            if fields.is_empty() {
                return Err(CliError::MissingArgument("--fields is required for a merge"));
            }
            Ok(Resolution::Merge(fields))
        }
        Strategy::Manual => {
            let raw = values.ok_or(CliError::MissingArgument("--values is required for a manual resolution"))?;
            Ok(Resolution::Manual(parse_fields("values", raw)?))
        }
    }
}
