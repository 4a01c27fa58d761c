use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tether_core::models::{FailedOperation, Fields, NetworkStatusSnapshot};
use tether_core::{ConflictRecord, LocalStore, Operation, OperationId, SyncEngine};

use crate::error::CliError;
use crate::settings::Settings;

pub async fn open_store(db_path: &Path) -> Result<LocalStore, CliError> {
    Ok(LocalStore::open_path(db_path).await?)
}

/// Engine over the local store; needs a configured backend
pub async fn open_engine(settings: &Settings) -> Result<SyncEngine, CliError> {
    if !settings.has_remote() {
        return Err(CliError::SyncNotConfigured);
    }
    let store = open_store(&settings.db_path).await?;
    let mut builder = SyncEngine::builder(settings.config.clone()).store(store);
    if let Some(token) = &settings.token {
        builder = builder.token(token.clone());
    }
    Ok(builder.build()?)
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Parse a `--data`/`--values` argument into a field map
pub fn parse_fields(flag: &'static str, raw: &str) -> Result<Fields, CliError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(CliError::InvalidFields {
            flag,
            message: format!("expected an object, got {}", json_type(&other)),
        }),
        Err(error) => Err(CliError::InvalidFields {
            flag,
            message: error.to_string(),
        }),
    }
}

const fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn parse_operation_id(raw: &str) -> Result<OperationId, CliError> {
    raw.trim()
        .parse()
        .map_err(|_| CliError::InvalidOperationId(raw.trim().to_string()))
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_operation_lines(operations: &[Operation], now_ms: i64) -> Vec<String> {
    operations
        .iter()
        .map(|operation| {
            let mut line = format!(
                "{:>4}  {}  {:<6}  {}/{}  retries={}",
                operation.seq,
                operation.id,
                operation.op_type.as_str(),
                operation.kind,
                operation.entity_id,
                operation.retry_count
            );
            if let Some(at) = operation.next_attempt_at.filter(|at| *at > now_ms) {
                line.push_str(&format!("  next={}", format_timestamp(at)));
            }
            if let Some(error) = &operation.last_error {
                line.push_str(&format!("  error=\"{}\"", error.message));
            }
            line
        })
        .collect()
}

pub fn format_failed_lines(failed: &[FailedOperation]) -> Vec<String> {
    failed
        .iter()
        .map(|failed| {
            format!(
                "{}  {}  {:<6}  {}/{}  {}: {}",
                format_timestamp(failed.failed_at),
                failed.operation.id,
                failed.operation.op_type.as_str(),
                failed.operation.kind,
                failed.operation.entity_id,
                failed.reason,
                failed.message
            )
        })
        .collect()
}

pub fn format_conflict_lines(conflicts: &[ConflictRecord]) -> Vec<String> {
    conflicts
        .iter()
        .map(|conflict| {
            format!(
                "{}  {:<13}  {}/{}  fields={}  local=v{} server=v{}",
                format_timestamp(conflict.detected_at),
                conflict.conflict_type.as_str(),
                conflict.kind,
                conflict.item_id,
                conflict.fields.join(","),
                conflict.local.version,
                conflict.server.version
            )
        })
        .collect()
}

pub fn format_network(network: &NetworkStatusSnapshot) -> String {
    let state = if network.is_online {
        if network.is_slow_connection {
            "online (slow)"
        } else {
            "online"
        }
    } else {
        "offline"
    };
    network.last_online_at.map_or_else(
        || state.to_string(),
        |at| format!("{state}, last online {}", format_timestamp(at)),
    )
}
