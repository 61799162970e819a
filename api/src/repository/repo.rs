use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Sqlite, Transaction};

use forge_inbox::{repo::Repo, upstream::RepoRecord, RepoId, UserId};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{db_error, Repository},
};

#[async_trait]
pub trait RepoRepository {
    /// Creates or refreshes the cached metadata for an upstream repository.
    /// Idempotent; called for every ingested notification.
    async fn upsert_repo(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        record: &RepoRecord,
        user_id: UserId,
    ) -> Result<Repo, ForgeInboxError>;

    async fn get_repo(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        repo_id: RepoId,
        user_id: UserId,
    ) -> Result<Option<Repo>, ForgeInboxError>;
}

#[async_trait]
impl RepoRepository for Repository {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(repo = record.full_name, user.id = user_id.to_string()),
        err
    )]
    async fn upsert_repo(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        record: &RepoRecord,
        user_id: UserId,
    ) -> Result<Repo, ForgeInboxError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, RepoRow>(
            r#"
                INSERT INTO repo
                  (id, user_id, upstream_id, full_name, owner_login, private,
                   default_branch, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (user_id, upstream_id) DO UPDATE SET
                  full_name = excluded.full_name,
                  owner_login = excluded.owner_login,
                  private = excluded.private,
                  default_branch = excluded.default_branch,
                  updated_at = excluded.updated_at
                RETURNING *
            "#,
        )
        .bind(RepoId::new().to_string())
        .bind(user_id.to_string())
        .bind(&record.upstream_id)
        .bind(&record.full_name)
        .bind(&record.owner_login)
        .bind(record.private)
        .bind(&record.default_branch)
        .bind(now)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to upsert repository {}: {err}", record.full_name);
            db_error(err, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(repo_id = repo_id.to_string()),
        err
    )]
    async fn get_repo(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        repo_id: RepoId,
        user_id: UserId,
    ) -> Result<Option<Repo>, ForgeInboxError> {
        let row = sqlx::query_as::<_, RepoRow>(
            r#"SELECT * FROM repo WHERE id = ? AND user_id = ?"#,
        )
        .bind(repo_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch repository {repo_id}: {err}");
            db_error(err, message)
        })?;

        row.map(|row| row.try_into()).transpose()
    }
}

#[derive(Debug, FromRow)]
pub struct RepoRow {
    pub id: String,
    pub user_id: String,
    pub upstream_id: String,
    pub full_name: String,
    pub owner_login: String,
    pub private: bool,
    pub default_branch: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RepoRow> for Repo {
    type Error = ForgeInboxError;

    fn try_from(row: RepoRow) -> Result<Self, Self::Error> {
        Ok(Repo {
            id: row
                .id
                .parse::<uuid::Uuid>()
                .map(RepoId::from)
                .context("Invalid repository id in storage")?,
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            upstream_id: row.upstream_id,
            full_name: row.full_name,
            owner_login: row.owner_login,
            private: row.private,
            default_branch: row.default_branch,
            updated_at: row.updated_at,
        })
    }
}
