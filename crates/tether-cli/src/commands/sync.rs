use tether_core::queue::{PassOutcome, ProcessReport};
use tether_core::scheduler::{SkipReason, TriggerOutcome};

use crate::commands::common::{format_timestamp, open_engine, print_json};
use crate::error::CliError;
use crate::settings::Settings;

pub async fn run_sync(as_json: bool, settings: &Settings) -> Result<(), CliError> {
    let engine = open_engine(settings).await?;
    engine.check_connectivity().await;
    let outcome = engine.sync_now().await?;

    if as_json {
        return print_json(&outcome);
    }
    println!("{}", describe_outcome(&outcome));
    Ok(())
}

pub fn describe_outcome(outcome: &TriggerOutcome) -> String {
    match outcome {
        TriggerOutcome::Ran { report } => describe_report(report),
        TriggerOutcome::Skipped { reason } => match reason {
            SkipReason::Offline => "Sync skipped: the backend is unreachable".to_string(),
            SkipReason::Empty => "Nothing to sync".to_string(),
            SkipReason::AlreadyRunning => "Sync skipped: another pass is running".to_string(),
            SkipReason::Suspended => "Sync skipped: automatic sync is suspended".to_string(),
        },
        TriggerOutcome::Deferred => "Sync deferred: waiting for the retry delay".to_string(),
    }
}

fn describe_report(report: &ProcessReport) -> String {
    let summary = format!(
        "{} synced, {} failed, {} conflicts, {} remaining",
        report.succeeded,
        report.failed.len(),
        report.conflicts.len(),
        report.remaining
    );
    match &report.outcome {
        PassOutcome::Drained | PassOutcome::Empty => summary,
        PassOutcome::Offline => format!("{summary} (went offline)"),
        PassOutcome::AlreadyRunning => format!("{summary} (another pass is running)"),
        PassOutcome::Waiting { until } => format!("{summary} (next retry {})", format_timestamp(*until)),
        PassOutcome::Stalled { error } => format!("{summary} (stopped: {})", error.message),
    }
}
