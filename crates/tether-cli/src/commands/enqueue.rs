use tether_core::{EntityId, EntityKind, OperationDraft};

use crate::cli::EnqueueCommands;
use crate::commands::common::{open_engine, parse_fields};
use crate::error::CliError;
use crate::settings::Settings;

pub async fn run_enqueue(command: EnqueueCommands, settings: &Settings) -> Result<(), CliError> {
    let draft = build_draft(command)?;
    let engine = open_engine(settings).await?;
    if engine.session().await?.is_none() {
        // Identity comes from the backend when nothing is cached.
        engine.check_connectivity().await;
    }
    let operation_id = engine.enqueue(draft).await?;
    println!("{operation_id}");
    Ok(())
}

pub fn build_draft(command: EnqueueCommands) -> Result<OperationDraft, CliError> {
    let draft = match command {
        EnqueueCommands::Create { kind, data, parent } => {
            let draft = OperationDraft::create(EntityKind::new(kind)?, parse_fields("data", &data)?);
            match parent {
                Some(parent) => draft.with_parent(EntityId::new(parent)?),
                None => draft,
            }
        }
        EnqueueCommands::Update { kind, id, data } => {
            OperationDraft::update(EntityKind::new(kind)?, EntityId::new(id)?, parse_fields("data", &data)?)
        }
        EnqueueCommands::Delete { kind, id } => OperationDraft::delete(EntityKind::new(kind)?, EntityId::new(id)?),
    };
    Ok(draft)
}
