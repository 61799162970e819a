use std::sync::Arc;

use clap::Parser;
use tracing::error;

use forge_inbox_api::{
    build_pool, build_services,
    commands::{self, Cli, Commands},
    configuration::Settings,
    credentials::FileCredentialStore,
    integrations::github::GithubClient,
    observability::{get_subscriber, init_subscriber},
    run_daemon,
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::new().expect("Cannot load forge-inbox configuration");

    if let Commands::Serve {
        port,
        data_dir,
        no_auto_open,
    } = &cli.command
    {
        if let Some(port) = port {
            settings.application.port = *port;
        }
        if let Some(data_dir) = data_dir {
            settings.application.data_dir = Some(data_dir.clone());
        }
        if *no_auto_open {
            settings.application.auto_open = false;
        }
    }

    init_subscriber(
        get_subscriber(&settings.application.log_directive),
        log::LevelFilter::Warn,
    );

    let data_dir = settings.data_dir();
    std::fs::create_dir_all(&data_dir).expect("Failed to create the data directory");

    let database_url = format!("sqlite://{}", settings.database_path().display());
    let pool = Arc::new(
        build_pool(&database_url)
            .await
            .expect("Failed to open the local datastore"),
    );

    let credentials = Arc::new(FileCredentialStore::new(&data_dir));
    let github = Arc::new(GithubClient::new(
        None,
        settings.sync.page_size,
        credentials.clone(),
    ));
    let services = build_services(pool, &settings, github, credentials);

    let result = match cli.command {
        Commands::Serve { .. } => run_daemon(&services, &settings).await,
        Commands::Sync => commands::run_sync(&services).await,
        Commands::Backfill {
            before,
            max_count,
            unread_only,
        } => commands::run_backfill(&services, before, max_count, unread_only).await,
        Commands::Token { command } => commands::run_token_command(&services, command).await,
    };

    match result {
        Err(err) => {
            error!("forge-inbox failed: {err:?}");
            panic!("forge-inbox failed: {err:?}")
        }
        Ok(()) => Ok(()),
    }
}
