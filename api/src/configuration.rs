use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub database: DatabaseSettings,
    pub sync: SyncSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    /// Listening port handed to the external HTTP layer.
    pub port: u16,
    pub log_directive: String,
    pub data_dir: Option<PathBuf>,
    pub auto_open: bool,
    /// Allow-list for the external HTTP boundary's CORS handling, from
    /// `FORGE_INBOX_CORS_ALLOWED_ORIGINS`.
    pub cors_allowed_origins: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    pub page_size: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub idle_poll_interval_ms: u64,
    pub lease_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_attempts: i64,
    pub shutdown_grace_secs: u64,
    pub count_cache_ttl_secs: u64,
}

impl Settings {
    pub fn new_from_file(file: Option<String>) -> Result<Self, ConfigError> {
        let config_file_required = file.is_some();
        let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config".into());
        let config_file = file
            .or_else(|| env::var("CONFIG_FILE").ok())
            .unwrap_or_else(|| format!("{config_path}/local"));

        let default_config_file = format!("{config_path}/default");

        let config = Config::builder()
            .set_default("application.port", 7480)?
            .set_default("application.log_directive", "info")?
            .set_default("application.auto_open", true)?
            .set_default("database.filename", "forge-inbox.db")?
            .set_default("sync.page_size", 50)?
            .set_default("sync.concurrency", 8)?
            .set_default("scheduler.worker_count", 4)?
            .set_default("scheduler.idle_poll_interval_ms", 500)?
            .set_default("scheduler.lease_ttl_secs", 60)?
            .set_default("scheduler.sweep_interval_secs", 30)?
            .set_default("scheduler.backoff_base_secs", 5)?
            .set_default("scheduler.backoff_cap_secs", 600)?
            .set_default("scheduler.max_attempts", 5)?
            .set_default("scheduler.shutdown_grace_secs", 10)?
            .set_default("scheduler.count_cache_ttl_secs", 2)?
            .add_source(File::with_name(&default_config_file).required(false))
            .add_source(File::with_name(&config_file).required(config_file_required))
            .add_source(Environment::with_prefix("forge_inbox").separator("__"))
            .build()?;

        let mut settings: Settings = config.try_deserialize()?;
        if let Ok(origins) = env::var("FORGE_INBOX_CORS_ALLOWED_ORIGINS") {
            settings.application.cors_allowed_origins = Some(origins);
        }
        Ok(settings)
    }

    pub fn new() -> Result<Self, ConfigError> {
        Settings::new_from_file(None)
    }

    /// Data directory resolution order: explicit setting, then the
    /// platform convention directory.
    pub fn data_dir(&self) -> PathBuf {
        self.application
            .data_dir
            .clone()
            .unwrap_or_else(default_data_dir)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(&self.database.filename)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_count: self.scheduler.worker_count,
            idle_poll_interval: Duration::from_millis(self.scheduler.idle_poll_interval_ms),
            lease_ttl: Duration::from_secs(self.scheduler.lease_ttl_secs),
            sweep_interval: Duration::from_secs(self.scheduler.sweep_interval_secs),
            backoff_base: Duration::from_secs(self.scheduler.backoff_base_secs),
            backoff_cap: Duration::from_secs(self.scheduler.backoff_cap_secs),
            max_attempts: self.scheduler.max_attempts,
            shutdown_grace: Duration::from_secs(self.scheduler.shutdown_grace_secs),
        }
    }

    pub fn count_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.scheduler.count_cache_ttl_secs)
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = env::var("HOME") {
            return Path::new(&home).join("Library/Application Support/forge-inbox");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = env::var("APPDATA") {
            return Path::new(&appdata).join("forge-inbox");
        }
    }
    if let Ok(xdg_data_home) = env::var("XDG_DATA_HOME") {
        return Path::new(&xdg_data_home).join("forge-inbox");
    }
    if let Ok(home) = env::var("HOME") {
        return Path::new(&home).join(".local/share/forge-inbox");
    }
    PathBuf::from(".")
}
