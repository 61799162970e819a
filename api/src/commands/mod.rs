use std::{io::Read, path::PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use crate::{forge_inbox::ForgeInboxError, Services};

#[derive(Debug, Parser)]
#[command(name = "forge-inbox-api", version, about = "Local notification triage daemon")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the daemon: migrations, scheduler and periodic sync.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Do not open the web UI in a browser tab on startup.
        #[arg(long)]
        no_auto_open: bool,
    },
    /// Run one incremental sync and exit.
    Sync,
    /// Ingest historical notifications older than the backfill cursor.
    Backfill {
        /// RFC 3339 timestamp; defaults to the stored backfill cursor.
        #[arg(long)]
        before: Option<String>,
        #[arg(long)]
        max_count: Option<u32>,
        #[arg(long)]
        unread_only: bool,
    },
    /// Manage the upstream access token.
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Debug, Subcommand)]
pub enum TokenCommands {
    /// Read a token from stdin, validate it upstream and store it.
    Set,
    Clear,
    Show,
}

pub async fn run_sync(services: &Services) -> Result<(), ForgeInboxError> {
    let user = services.user_service.get_user().await?;
    let outcome = services.sync_service.sync_notifications(user.id).await?;
    println!(
        "Synced {} notifications ({} created, {} updated, {} failed)",
        outcome.fetched, outcome.created, outcome.updated, outcome.failed
    );
    Ok(())
}

pub async fn run_backfill(
    services: &Services,
    before: Option<String>,
    max_count: Option<u32>,
    unread_only: bool,
) -> Result<(), ForgeInboxError> {
    let before = before
        .map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|parsed| parsed.with_timezone(&Utc))
                .context("--before must be an RFC 3339 timestamp")
        })
        .transpose()?;
    let user = services.user_service.get_user().await?;
    let outcome = services
        .sync_service
        .backfill(before, max_count, unread_only, user.id)
        .await?;
    println!(
        "Backfilled {} notifications ({} created, {} failed)",
        outcome.fetched, outcome.created, outcome.failed
    );
    Ok(())
}

pub async fn run_token_command(
    services: &Services,
    command: TokenCommands,
) -> Result<(), ForgeInboxError> {
    match command {
        TokenCommands::Set => {
            let mut token = String::new();
            std::io::stdin()
                .read_to_string(&mut token)
                .context("Failed to read the token from stdin")?;
            let token = token.trim().to_string();
            if token.is_empty() {
                return Err(ForgeInboxError::InvalidInputData {
                    source: None,
                    user_error: "No token provided on stdin".to_string(),
                });
            }
            let login = services
                .user_service
                .set_token(SecretString::new(token))
                .await?;
            println!("Token stored for upstream user {login}");
        }
        TokenCommands::Clear => {
            services.user_service.clear_token().await?;
            println!("Token cleared");
        }
        TokenCommands::Show => match services.user_service.token_status().await? {
            Some(login) => println!("Token configured for upstream user {login}"),
            None => println!("No token configured"),
        },
    }
    Ok(())
}
