use serde::Serialize;

use crate::commands::common::{format_network, format_timestamp, open_engine, open_store, print_json};
use crate::error::CliError;
use crate::settings::Settings;

/// Status available without a backend
#[derive(Debug, Serialize)]
pub struct StoreStatus {
    pub pending: usize,
    pub failed: usize,
    pub next_retry_at: Option<i64>,
    pub conflicts: usize,
    pub remote_configured: bool,
}

pub async fn run_status(check: bool, as_json: bool, settings: &Settings) -> Result<(), CliError> {
    if !settings.has_remote() {
        let status = store_status(settings).await?;
        if as_json {
            return print_json(&status);
        }
        println!("remote:    not configured");
        print_counts(status.pending, status.failed, status.next_retry_at, status.conflicts);
        return Ok(());
    }

    let engine = open_engine(settings).await?;
    if check {
        engine.check_connectivity().await;
    }
    let status = engine.status().await?;
    if as_json {
        return print_json(&status);
    }

    if check {
        println!("network:   {}", format_network(&status.network));
    } else {
        println!("network:   not checked (use --check)");
    }
    println!(
        "scheduler: {}{}",
        status.scheduler,
        if status.scheduler_suspended { " (suspended)" } else { "" }
    );
    print_counts(
        status.queue.length,
        status.queue.failed_count,
        status.queue.next_retry_at,
        status.conflicts,
    );
    Ok(())
}

pub async fn store_status(settings: &Settings) -> Result<StoreStatus, CliError> {
    let store = open_store(&settings.db_path).await?;
    let (pending, failed, next_retry_at) = store.queue_counts().await?;
    Ok(StoreStatus {
        pending,
        failed,
        next_retry_at,
        conflicts: store.conflict_count().await?,
        remote_configured: settings.has_remote(),
    })
}

fn print_counts(pending: usize, failed: usize, next_retry_at: Option<i64>, conflicts: usize) {
    println!("pending:   {pending}");
    if let Some(at) = next_retry_at {
        println!("retry at:  {}", format_timestamp(at));
    }
    println!("failed:    {failed}");
    println!("conflicts: {conflicts}");
}
