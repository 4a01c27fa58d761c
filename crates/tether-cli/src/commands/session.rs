use std::path::Path;

use tether_core::models::SessionContext;
use tether_core::util::now_millis;

use crate::commands::common::{format_timestamp, open_store};
use crate::error::CliError;

pub async fn run_session_show(db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    match store.session().await? {
        Some(session) => println!(
            "account={} user={} cached={}",
            session.account_id,
            session.user_id,
            format_timestamp(session.cached_at)
        ),
        None => println!("No cached session."),
    }
    Ok(())
}

pub async fn run_session_set(account_id: &str, user_id: &str, db_path: &Path) -> Result<(), CliError> {
    let account_id = account_id.trim();
    let user_id = user_id.trim();
    if account_id.is_empty() || user_id.is_empty() {
        return Err(CliError::MissingArgument("Account and user IDs cannot be empty"));
    }
    let store = open_store(db_path).await?;
    store
        .set_session(&SessionContext {
            account_id: account_id.to_string(),
            user_id: user_id.to_string(),
            cached_at: now_millis(),
        })
        .await?;
    println!("account={account_id} user={user_id}");
    Ok(())
}

pub async fn run_session_clear(db_path: &Path) -> Result<(), CliError> {
    let store = open_store(db_path).await?;
    store.clear_session().await?;
    println!("Session cleared");
    Ok(())
}
