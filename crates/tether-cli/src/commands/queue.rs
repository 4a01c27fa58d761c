use std::path::Path;

use tether_core::util::now_millis;

use crate::commands::common::{
    format_failed_lines, format_operation_lines, open_store, parse_operation_id, print_json,
};
use crate::error::CliError;

pub async fn run_queue_list(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let operations = store.pending_operations().await?;

    if as_json {
        return print_json(&operations);
    }
    if operations.is_empty() {
        println!("Queue is empty.");
        return Ok(());
    }
    for line in format_operation_lines(&operations, now_millis()) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_failed(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    let failed = store.failed_operations().await?;

    if as_json {
        return print_json(&failed);
    }
    if failed.is_empty() {
        println!("No failed operations.");
        return Ok(());
    }
    for line in format_failed_lines(&failed) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_queue_ack(id: &str, db_path: &Path) -> Result<(), CliError> {
    let operation_id = parse_operation_id(id)?;
    let store = open_store(db_path).await?;
    if !store.acknowledge_failure(&operation_id).await? {
        return Err(CliError::FailedOperationNotFound(operation_id.to_string()));
    }
    println!("{operation_id}");
    Ok(())
}

pub async fn run_queue_cancel(id: &str, db_path: &Path) -> Result<(), CliError> {
    let operation_id = parse_operation_id(id)?;
    let store = open_store(db_path).await?;
    let Some(cancelled) = store.cancel_operation(&operation_id, now_millis()).await? else {
        return Err(CliError::OperationNotFound(operation_id.to_string()));
    };
    tracing::info!(operation_id = %cancelled.id, "Cancelled operation");
    println!("{}", cancelled.id);
    Ok(())
}
