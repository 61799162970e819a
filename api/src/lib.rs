use std::{str::FromStr, sync::Arc};

use anyhow::Context;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::info;

pub mod commands;
pub mod configuration;
pub mod credentials;
pub mod forge_inbox;
pub mod integrations;
pub mod jobs;
pub mod observability;
pub mod repository;
pub mod scheduler;

use crate::{
    configuration::Settings,
    credentials::CredentialStore,
    forge_inbox::{
        notification::service::NotificationService,
        rule::service::RuleService,
        sync::service::SyncService,
        tag::service::TagService,
        user::service::UserService,
        view::service::{CountCache, ViewService},
        ForgeInboxError,
    },
    integrations::UpstreamClient,
    jobs::handlers::{
        ApplyRuleHandler, BackfillHandler, PollHandler, SubjectRefreshHandler,
        UpdateCheckHandler,
    },
    jobs::JobKind,
    repository::Repository,
    scheduler::{JobRegistry, Scheduler, SchedulerHandle},
};

/// Opens (creating if needed) the single local datastore file and brings
/// the schema to the current version. A migration failure is fatal to the
/// caller.
pub async fn build_pool(database_url: &str) -> Result<SqlitePool, ForgeInboxError> {
    let options = SqliteConnectOptions::from_str(database_url)
        .context("Invalid database URL")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .context("Failed to open the local datastore")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to migrate the local datastore")?;

    Ok(pool)
}

pub struct Services {
    pub repository: Arc<Repository>,
    pub count_cache: Arc<CountCache>,
    pub notification_service: Arc<NotificationService>,
    pub tag_service: Arc<TagService>,
    pub view_service: Arc<ViewService>,
    pub rule_service: Arc<RuleService>,
    pub sync_service: Arc<SyncService>,
    pub user_service: Arc<UserService>,
}

pub fn build_services(
    pool: Arc<SqlitePool>,
    settings: &Settings,
    upstream: Arc<dyn UpstreamClient>,
    credentials: Arc<dyn CredentialStore>,
) -> Services {
    let repository = Arc::new(Repository::new(pool));
    let count_cache = Arc::new(CountCache::new(settings.count_cache_ttl()));
    let scheduler_config = settings.scheduler_config();

    let notification_service = Arc::new(NotificationService::new(
        repository.clone(),
        count_cache.clone(),
    ));
    let tag_service = Arc::new(TagService::new(repository.clone()));
    let view_service = Arc::new(ViewService::new(repository.clone(), count_cache.clone()));
    let rule_service = Arc::new(RuleService::new(
        repository.clone(),
        view_service.clone(),
        count_cache.clone(),
        scheduler_config.max_attempts,
    ));
    let sync_service = Arc::new(SyncService::new(
        repository.clone(),
        upstream.clone(),
        count_cache.clone(),
        settings.sync.concurrency,
        scheduler_config.max_attempts,
    ));
    let user_service = Arc::new(UserService::new(
        repository.clone(),
        credentials,
        upstream,
    ));

    Services {
        repository,
        count_cache,
        notification_service,
        tag_service,
        view_service,
        rule_service,
        sync_service,
        user_service,
    }
}

pub fn build_job_registry(services: &Services) -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register(
        JobKind::Poll,
        Arc::new(PollHandler {
            sync_service: services.sync_service.clone(),
        }),
    );
    registry.register(
        JobKind::ApplyRule,
        Arc::new(ApplyRuleHandler {
            rule_service: services.rule_service.clone(),
        }),
    );
    registry.register(
        JobKind::Backfill,
        Arc::new(BackfillHandler {
            sync_service: services.sync_service.clone(),
            rule_service: services.rule_service.clone(),
        }),
    );
    registry.register(
        JobKind::SubjectRefresh,
        Arc::new(SubjectRefreshHandler {
            sync_service: services.sync_service.clone(),
        }),
    );
    registry.register(JobKind::UpdateCheck, Arc::new(UpdateCheckHandler));
    registry
}

pub fn start_scheduler(services: &Services, settings: &Settings) -> SchedulerHandle {
    let registry = build_job_registry(services);
    Scheduler::new(
        services.repository.clone(),
        registry,
        settings.scheduler_config(),
    )
    .start()
}

/// Runs the daemon until interrupted: the scheduler drives sync and rule
/// application, the external HTTP layer fronts the services.
pub async fn run_daemon(services: &Services, settings: &Settings) -> Result<(), ForgeInboxError> {
    let scheduler = start_scheduler(services, settings);
    info!(
        "forge-inbox daemon running (port {}, data dir {})",
        settings.application.port,
        settings.data_dir().display()
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    info!("Shutdown signal received");
    scheduler.shutdown().await;
    Ok(())
}
