//! Tether CLI - inspect and drive the offline sync queue from a terminal

mod cli;
mod commands;
mod error;
mod settings;


use clap::Parser;

use crate::cli::{Cli, Commands, ConflictCommands, QueueCommands, SessionCommands};
use crate::commands::completions::run_completions;
use crate::commands::conflicts::{
    run_conflicts_detect, run_conflicts_list, run_conflicts_resolve, run_conflicts_resolve_all,
};
use crate::commands::enqueue::run_enqueue;
use crate::commands::queue::{run_queue_ack, run_queue_cancel, run_queue_failed, run_queue_list};
use crate::commands::session::{run_session_clear, run_session_set, run_session_show};
use crate::commands::status::run_status;
use crate::commands::sync::run_sync;
use crate::error::CliError;
use crate::settings::Settings;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        tracing::debug!(?error, "Command failed");
        eprintln!("Error: {}", error.display_message());
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tether=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }
    let settings = Settings::resolve(&cli)?;
    let db_path = settings.db_path.as_path();

    match cli.command {
        Commands::Status { check, json } => run_status(check, json, &settings).await?,
        Commands::Queue { command } => match command {
            QueueCommands::List { json } => run_queue_list(json, db_path).await?,
            QueueCommands::Failed { json } => run_queue_failed(json, db_path).await?,
            QueueCommands::Ack { id } => run_queue_ack(&id, db_path).await?,
            QueueCommands::Cancel { id } => run_queue_cancel(&id, db_path).await?,
        },
        Commands::Enqueue { command } => run_enqueue(command, &settings).await?,
        Commands::Sync { json } => run_sync(json, &settings).await?,
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { scope, json } => {
                run_conflicts_list(scope.as_deref(), json, db_path).await?;
            }
            ConflictCommands::Detect { scope, json } => run_conflicts_detect(&scope, json, &settings).await?,
            ConflictCommands::Resolve {
                id,
                strategy,
                fields,
                values,
            } => run_conflicts_resolve(&id, strategy, fields, values.as_deref(), &settings).await?,
            ConflictCommands::ResolveAll { strategy, json } => {
                run_conflicts_resolve_all(strategy, json, &settings).await?;
            }
        },
        Commands::Session { command } => match command {
            SessionCommands::Show => run_session_show(db_path).await?,
            SessionCommands::Set { account_id, user_id } => {
                run_session_set(&account_id, &user_id, db_path).await?;
            }
            SessionCommands::Clear => run_session_clear(db_path).await?,
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
