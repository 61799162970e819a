use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Singleton record for this local install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Upstream login, set when a token is configured and validated.
    pub upstream_login: Option<String>,
    pub settings: UserSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSettings {
    /// Steady-state poll interval for the incremental sync trigger.
    pub poll_interval_secs: u64,
    /// Page size used against the upstream notification listing.
    pub sync_page_size: usize,
    /// Notifications older than this are eligible for pruning. `None`
    /// disables retention.
    pub retention_days: Option<u32>,
    pub update_check: UpdateCheckInterval,
    /// While set in the future, periodic polling is suspended.
    pub mute_until: Option<DateTime<Utc>>,
}

impl Default for UserSettings {
    fn default() -> Self {
        UserSettings {
            poll_interval_secs: 20,
            sync_page_size: 50,
            retention_days: None,
            update_check: UpdateCheckInterval::Daily,
            mute_until: None,
        }
    }
}

macro_attr! {
    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy, Eq, EnumFromStr!, EnumDisplay!)]
    #[serde(rename_all = "snake_case")]
    pub enum UpdateCheckInterval {
        OnStartup,
        Daily,
        Weekly,
        Never,
    }
}

impl UpdateCheckInterval {
    pub fn period(&self) -> Option<chrono::Duration> {
        match self {
            UpdateCheckInterval::Daily => Some(chrono::Duration::days(1)),
            UpdateCheckInterval::Weekly => Some(chrono::Duration::weeks(1)),
            UpdateCheckInterval::OnStartup | UpdateCheckInterval::Never => None,
        }
    }
}
