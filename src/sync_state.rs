use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::UserId;

/// Per-user sync cursor record.
///
/// `latest_notification_at` drives incremental polling and only advances
/// after a batch commits; `oldest_notification_synced_at` is the resumable
/// backfill cursor and only moves backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: UserId,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub latest_notification_at: Option<DateTime<Utc>>,
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SyncState {
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> SyncState {
        SyncState {
            user_id,
            last_successful_poll: None,
            latest_notification_at: None,
            initial_sync_completed_at: None,
            oldest_notification_synced_at: None,
            updated_at: now,
        }
    }
}
