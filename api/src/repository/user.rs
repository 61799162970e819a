use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use forge_inbox::{
    user::{User, UserSettings},
    UserId,
};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{db_error, Repository},
};

#[async_trait]
pub trait UserRepository {
    /// The install's singleton user, created on first access.
    async fn get_or_create_user(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
    ) -> Result<User, ForgeInboxError>;

    async fn update_user_login(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        upstream_login: Option<&str>,
        user_id: UserId,
    ) -> Result<User, ForgeInboxError>;

    async fn update_user_settings(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        settings: &UserSettings,
        user_id: UserId,
    ) -> Result<User, ForgeInboxError>;
}

#[async_trait]
impl UserRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn get_or_create_user(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
    ) -> Result<User, ForgeInboxError> {
        let existing = sqlx::query_as::<_, UserRow>("SELECT * FROM user LIMIT 1")
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch user: {err}");
                db_error(err, message)
            })?;
        if let Some(row) = existing {
            return row.try_into();
        }

        let now = Utc::now();
        let settings = serde_json::to_string(&UserSettings::default())
            .context("Failed to serialize default user settings")?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"
                INSERT INTO user (id, upstream_login, settings, created_at, updated_at)
                VALUES (?, NULL, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(UserId::new().to_string())
        .bind(settings)
        .bind(now)
        .bind(now)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to create user: {err}");
            db_error(err, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn update_user_login(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        upstream_login: Option<&str>,
        user_id: UserId,
    ) -> Result<User, ForgeInboxError> {
        let row = sqlx::query_as::<_, UserRow>(
            "UPDATE user SET upstream_login = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(upstream_login)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to update user login: {err}");
            db_error(err, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn update_user_settings(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        settings: &UserSettings,
        user_id: UserId,
    ) -> Result<User, ForgeInboxError> {
        let settings =
            serde_json::to_string(settings).context("Failed to serialize user settings")?;
        let row = sqlx::query_as::<_, UserRow>(
            "UPDATE user SET settings = ?, updated_at = ? WHERE id = ? RETURNING *",
        )
        .bind(settings)
        .bind(Utc::now())
        .bind(user_id.to_string())
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to update user settings: {err}");
            db_error(err, message)
        })?;

        row.try_into()
    }
}

#[derive(Debug, FromRow)]
pub struct UserRow {
    pub id: String,
    pub upstream_login: Option<String>,
    pub settings: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = ForgeInboxError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        Ok(User {
            id: row
                .id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            upstream_login: row.upstream_login,
            settings: serde_json::from_str(&row.settings)
                .context("Invalid user settings in storage")?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
