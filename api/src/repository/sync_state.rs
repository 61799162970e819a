use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use forge_inbox::{sync_state::SyncState, UserId};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{db_error, Repository},
};

/// Cursor fields updated after a successful sync batch. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default)]
pub struct SyncStatePatch {
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub latest_notification_at: Option<DateTime<Utc>>,
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SyncStateRepository {
    async fn get_or_create_sync_state(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<SyncState, ForgeInboxError>;

    async fn update_sync_state(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        patch: &SyncStatePatch,
        user_id: UserId,
    ) -> Result<SyncState, ForgeInboxError>;
}

#[async_trait]
impl SyncStateRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn get_or_create_sync_state(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<SyncState, ForgeInboxError> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            r#"
                INSERT INTO sync_state (user_id, updated_at)
                VALUES (?, ?)
                ON CONFLICT (user_id) DO UPDATE SET user_id = excluded.user_id
                RETURNING *
            "#,
        )
        .bind(user_id.to_string())
        .bind(Utc::now())
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to load sync state: {err}");
            db_error(err, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn update_sync_state(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        patch: &SyncStatePatch,
        user_id: UserId,
    ) -> Result<SyncState, ForgeInboxError> {
        let row = sqlx::query_as::<_, SyncStateRow>(
            r#"
                UPDATE sync_state SET
                  last_successful_poll = COALESCE(?, last_successful_poll),
                  latest_notification_at = COALESCE(?, latest_notification_at),
                  initial_sync_completed_at = COALESCE(?, initial_sync_completed_at),
                  oldest_notification_synced_at = COALESCE(?, oldest_notification_synced_at),
                  updated_at = ?
                WHERE user_id = ?
                RETURNING *
            "#,
        )
        .bind(patch.last_successful_poll)
        .bind(patch.latest_notification_at)
        .bind(patch.initial_sync_completed_at)
        .bind(patch.oldest_notification_synced_at)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to update sync state: {err}");
            db_error(err, message)
        })?;

        row.try_into()
    }
}

#[derive(Debug, FromRow)]
pub struct SyncStateRow {
    pub user_id: String,
    pub last_successful_poll: Option<DateTime<Utc>>,
    pub latest_notification_at: Option<DateTime<Utc>>,
    pub initial_sync_completed_at: Option<DateTime<Utc>>,
    pub oldest_notification_synced_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SyncStateRow> for SyncState {
    type Error = ForgeInboxError;

    fn try_from(row: SyncStateRow) -> Result<Self, Self::Error> {
        Ok(SyncState {
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            last_successful_poll: row.last_successful_poll,
            latest_notification_at: row.latest_notification_at,
            initial_sync_completed_at: row.initial_sync_completed_at,
            oldest_notification_synced_at: row.oldest_notification_synced_at,
            updated_at: row.updated_at,
        })
    }
}
