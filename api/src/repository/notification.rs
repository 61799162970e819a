use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};

use forge_inbox::{
    notification::{Notification, NotificationAction, NotificationWithRepo, Subject, SubjectType},
    repo::Repo,
    tag::Tag,
    NotificationId, Page, RepoId, TagId, UserId,
};

use crate::{
    forge_inbox::{ForgeInboxError, UpsertStatus},
    repository::{
        db_error,
        repo::RepoRow,
        search::{bind_query_args, NotificationQuery, QueryArg},
        tag::TagRow,
        Repository,
    },
};

/// Ingest-side input for the notification upsert: everything the sync
/// engine knows about one upstream notification after enrichment.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub upstream_id: String,
    pub repo_id: RepoId,
    pub subject: Subject,
    pub reason: String,
    pub author_login: Option<String>,
    pub unread: bool,
    pub upstream_updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationRepository {
    async fn get_notification(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<Option<NotificationWithRepo>, ForgeInboxError>;

    async fn get_notification_for_upstream_id(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        upstream_id: &str,
        user_id: UserId,
    ) -> Result<Option<Notification>, ForgeInboxError>;

    async fn create_or_update_notification(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        draft: NotificationDraft,
        user_id: UserId,
    ) -> Result<UpsertStatus<Notification>, ForgeInboxError>;

    /// The hand-off point from the query engine: executes a translated
    /// query and returns one page plus the total match count.
    async fn list_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        user_id: UserId,
    ) -> Result<Page<NotificationWithRepo>, ForgeInboxError>;

    async fn count_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError>;

    async fn apply_action(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_id: NotificationId,
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<Option<Notification>, ForgeInboxError>;

    async fn apply_action_by_ids(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_ids: &[NotificationId],
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError>;

    /// Applies one action to every row matching a translated query in a
    /// single statement, without materialising the result set first.
    async fn apply_action_by_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError>;

    async fn tags_for_notifications(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_ids: &[NotificationId],
    ) -> Result<HashMap<NotificationId, Vec<Tag>>, ForgeInboxError>;

    /// Retention: deletes archived notifications whose last upstream
    /// activity is older than the cutoff.
    async fn prune_notifications(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        older_than: DateTime<Utc>,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError>;
}

#[async_trait]
impl NotificationRepository for Repository {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(notification_id = notification_id.to_string()),
        err
    )]
    async fn get_notification(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<Option<NotificationWithRepo>, ForgeInboxError> {
        let row = sqlx::query_as::<_, NotificationWithRepoRow>(&format!(
            "SELECT {JOINED_COLUMNS} FROM notification \
             JOIN repo ON repo.id = notification.repo_id \
             WHERE notification.id = ? AND notification.user_id = ?"
        ))
        .bind(notification_id.0)
        .bind(user_id.to_string())
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch notification {notification_id}: {err}");
            db_error(err, message)
        })?;

        let Some(row) = row else { return Ok(None) };
        let mut with_repo: NotificationWithRepo = row.try_into()?;
        let tags = self
            .tags_for_notifications(executor, &[with_repo.notification.id])
            .await?;
        with_repo.tags = tags
            .into_values()
            .next()
            .unwrap_or_default();
        Ok(Some(with_repo))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(upstream_id), err)]
    async fn get_notification_for_upstream_id(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        upstream_id: &str,
        user_id: UserId,
    ) -> Result<Option<Notification>, ForgeInboxError> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT * FROM notification WHERE upstream_id = ? AND user_id = ?",
        )
        .bind(upstream_id)
        .bind(user_id.to_string())
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message =
                format!("Failed to fetch notification for upstream id {upstream_id}: {err}");
            db_error(err, message)
        })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(upstream_id = draft.upstream_id, user.id = user_id.to_string()),
        err
    )]
    async fn create_or_update_notification(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        draft: NotificationDraft,
        user_id: UserId,
    ) -> Result<UpsertStatus<Notification>, ForgeInboxError> {
        let existing = self
            .get_notification_for_upstream_id(executor, &draft.upstream_id, user_id)
            .await?;

        let Some(existing) = existing else {
            let now = Utc::now();
            let row = sqlx::query_as::<_, NotificationRow>(
                r#"
                    INSERT INTO notification
                      (user_id, upstream_id, repo_id, subject_kind, subject_title,
                       subject_number, subject_state, subject_merged,
                       subject_state_reason, subject_raw, reason, author_login,
                       is_read, effective_sort_date, upstream_updated_at, imported_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    RETURNING *
                "#,
            )
            .bind(user_id.to_string())
            .bind(&draft.upstream_id)
            .bind(draft.repo_id.to_string())
            .bind(draft.subject.kind.as_str().to_string())
            .bind(&draft.subject.title)
            .bind(draft.subject.number)
            .bind(&draft.subject.state)
            .bind(draft.subject.merged)
            .bind(&draft.subject.state_reason)
            .bind(draft.subject.raw.as_ref().map(|raw| raw.to_string()))
            .bind(&draft.reason)
            .bind(&draft.author_login)
            .bind(!draft.unread)
            .bind(draft.upstream_updated_at)
            .bind(draft.upstream_updated_at)
            .bind(now)
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to create notification for upstream id {}: {err}",
                    draft.upstream_id
                );
                db_error(err, message)
            })?;
            return Ok(UpsertStatus::Created(row.try_into()?));
        };

        if existing.upstream_updated_at == draft.upstream_updated_at
            && existing.subject == draft.subject
        {
            return Ok(UpsertStatus::Untouched(existing));
        }

        // Fresh upstream activity re-surfaces the thread's read state; an
        // older record (backfill) never regresses it.
        let is_read = if draft.upstream_updated_at > existing.upstream_updated_at {
            !draft.unread
        } else {
            existing.is_read
        };
        let effective_sort_date = match existing.snoozed_until {
            Some(until) if until > Utc::now() => until,
            _ => draft.upstream_updated_at.max(existing.upstream_updated_at),
        };
        let upstream_updated_at = draft.upstream_updated_at.max(existing.upstream_updated_at);

        let row = sqlx::query_as::<_, NotificationRow>(
            r#"
                UPDATE notification SET
                  subject_kind = ?,
                  subject_title = ?,
                  subject_number = ?,
                  subject_state = ?,
                  subject_merged = ?,
                  subject_state_reason = ?,
                  subject_raw = COALESCE(?, subject_raw),
                  reason = ?,
                  author_login = COALESCE(?, author_login),
                  is_read = ?,
                  effective_sort_date = ?,
                  upstream_updated_at = ?
                WHERE id = ?
                RETURNING *
            "#,
        )
        .bind(draft.subject.kind.as_str().to_string())
        .bind(&draft.subject.title)
        .bind(draft.subject.number)
        .bind(&draft.subject.state)
        .bind(draft.subject.merged)
        .bind(&draft.subject.state_reason)
        .bind(draft.subject.raw.as_ref().map(|raw| raw.to_string()))
        .bind(&draft.reason)
        .bind(&draft.author_login)
        .bind(is_read)
        .bind(effective_sort_date)
        .bind(upstream_updated_at)
        .bind(existing.id.0)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to update notification {}: {err}", existing.id);
            db_error(err, message)
        })?;

        Ok(UpsertStatus::Updated {
            old: existing,
            new: row.try_into()?,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn list_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        user_id: UserId,
    ) -> Result<Page<NotificationWithRepo>, ForgeInboxError> {
        let total = self
            .count_notifications_from_query(executor, query, user_id)
            .await?;

        let sql = format!(
            "SELECT {JOINED_COLUMNS} FROM notification \
             JOIN repo ON repo.id = notification.repo_id \
             WHERE notification.user_id = ? AND ({where_sql}) \
             ORDER BY notification.effective_sort_date DESC, notification.id DESC \
             LIMIT ? OFFSET ?",
            where_sql = query.where_sql,
        );
        let mut db_query =
            sqlx::query_as::<_, NotificationWithRepoRow>(&sql).bind(user_id.to_string());
        for arg in &query.args {
            db_query = match arg {
                QueryArg::Text(text) => db_query.bind(text.clone()),
                QueryArg::Bool(b) => db_query.bind(*b),
                QueryArg::DateTime(ts) => db_query.bind(*ts),
            };
        }
        let rows = db_query
            .bind(query.limit)
            .bind(query.offset)
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to list notifications from query: {err}");
                db_error(err, message)
            })?;

        let mut notifications = rows
            .into_iter()
            .map(|row| row.try_into())
            .collect::<Result<Vec<NotificationWithRepo>, ForgeInboxError>>()?;

        let ids: Vec<NotificationId> = notifications
            .iter()
            .map(|with_repo| with_repo.notification.id)
            .collect();
        let mut tags_by_id = self.tags_for_notifications(executor, &ids).await?;
        for with_repo in &mut notifications {
            with_repo.tags = tags_by_id
                .remove(&with_repo.notification.id)
                .unwrap_or_default();
        }

        Ok(Page {
            rows: notifications,
            total,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn count_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError> {
        let join = if query.joins.repo {
            " JOIN repo ON repo.id = notification.repo_id"
        } else {
            ""
        };
        let sql = format!(
            "SELECT count(*) FROM notification{join} \
             WHERE notification.user_id = ? AND ({where_sql})",
            where_sql = query.where_sql,
        );
        let count: i64 = bind_query_args(
            sqlx::query(&sql).bind(user_id.to_string()),
            &query.args,
        )
        .fetch_one(&mut **executor)
        .await
        .and_then(|row| {
            use sqlx::Row;
            row.try_get(0)
        })
        .map_err(|err| {
            let message = format!("Failed to count notifications from query: {err}");
            db_error(err, message)
        })?;

        Ok(count)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(notification_id = notification_id.to_string()),
        err
    )]
    async fn apply_action(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_id: NotificationId,
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<Option<Notification>, ForgeInboxError> {
        match tag_action(action) {
            Some((tag_id, assign)) => {
                self.apply_tag_action_by_ids(executor, &[notification_id], tag_id, assign)
                    .await?;
                self.get_notification_row(executor, notification_id, user_id)
                    .await
            }
            None => {
                let sql = format!(
                    "UPDATE notification SET {set_clause} \
                     WHERE id = ? AND user_id = ? RETURNING *",
                    set_clause = action_set_clause(action),
                );
                let row = bind_action_args(sqlx::query_as::<_, NotificationRow>(&sql), action)
                    .bind(notification_id.0)
                    .bind(user_id.to_string())
                    .fetch_optional(&mut **executor)
                    .await
                    .map_err(|err| {
                        let message = format!(
                            "Failed to apply action to notification {notification_id}: {err}"
                        );
                        db_error(err, message)
                    })?;
                row.map(|row| row.try_into()).transpose()
            }
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = notification_ids.len()), err)]
    async fn apply_action_by_ids(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_ids: &[NotificationId],
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError> {
        if notification_ids.is_empty() {
            return Ok(0);
        }
        if let Some((tag_id, assign)) = tag_action(action) {
            return self
                .apply_tag_action_by_ids(executor, notification_ids, tag_id, assign)
                .await;
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE notification SET ");
        match action {
            NotificationAction::Snooze { until } => {
                builder.push("snoozed_until = ");
                builder.push_bind(*until);
                builder.push(", effective_sort_date = ");
                builder.push_bind(*until);
            }
            other => {
                builder.push(action_set_clause(other));
            }
        }
        builder.push(" WHERE user_id = ");
        builder.push_bind(user_id.to_string());
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in notification_ids {
            separated.push_bind(id.0);
        }
        builder.push(")");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to apply bulk action by ids: {err}");
                db_error(err, message)
            })?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn apply_action_by_query(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        query: &NotificationQuery,
        action: &NotificationAction,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError> {
        let join = if query.joins.repo {
            " JOIN repo ON repo.id = notification.repo_id"
        } else {
            ""
        };
        let matching_ids = format!(
            "SELECT notification.id FROM notification{join} \
             WHERE notification.user_id = ? AND ({where_sql})",
            where_sql = query.where_sql,
        );

        let result = match tag_action(action) {
            Some((tag_id, true)) => {
                let sql = format!(
                    "INSERT INTO tag_assignment (tag_id, entity_type, entity_id) \
                     SELECT ?, 'notification', id FROM ({matching_ids}) \
                     ON CONFLICT DO NOTHING"
                );
                let query_with_tag = sqlx::query(&sql).bind(tag_id.to_string());
                bind_query_args(query_with_tag.bind(user_id.to_string()), &query.args)
                    .execute(&mut **executor)
                    .await
            }
            Some((tag_id, false)) => {
                let sql = format!(
                    "DELETE FROM tag_assignment \
                     WHERE tag_id = ? AND entity_type = 'notification' \
                     AND entity_id IN ({matching_ids})"
                );
                let query_with_tag = sqlx::query(&sql).bind(tag_id.to_string());
                bind_query_args(query_with_tag.bind(user_id.to_string()), &query.args)
                    .execute(&mut **executor)
                    .await
            }
            None => {
                let sql = format!(
                    "UPDATE notification SET {set_clause} \
                     WHERE id IN ({matching_ids})",
                    set_clause = action_set_clause(action),
                );
                let db_query = bind_action_args_plain(sqlx::query(&sql), action);
                bind_query_args(db_query.bind(user_id.to_string()), &query.args)
                    .execute(&mut **executor)
                    .await
            }
        }
        .map_err(|err| {
            let message = format!("Failed to apply bulk action by query: {err}");
            db_error(err, message)
        })?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn tags_for_notifications(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_ids: &[NotificationId],
    ) -> Result<HashMap<NotificationId, Vec<Tag>>, ForgeInboxError> {
        if notification_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT ta.entity_id AS entity_id, tag.* FROM tag_assignment ta \
             JOIN tag ON tag.id = ta.tag_id \
             WHERE ta.entity_type = 'notification' AND ta.entity_id IN (",
        );
        let mut separated = builder.separated(", ");
        for id in notification_ids {
            separated.push_bind(id.0);
        }
        builder.push(") ORDER BY tag.display_order, tag.name");

        let rows = builder
            .build_query_as::<TaggedEntityRow>()
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch notification tags: {err}");
                db_error(err, message)
            })?;

        let mut tags_by_id: HashMap<NotificationId, Vec<Tag>> = HashMap::new();
        for row in rows {
            let entity_id = NotificationId(row.entity_id);
            tags_by_id
                .entry(entity_id)
                .or_default()
                .push(row.tag.try_into()?);
        }
        Ok(tags_by_id)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn prune_notifications(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        older_than: DateTime<Utc>,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError> {
        let result = sqlx::query(
            "DELETE FROM notification \
             WHERE user_id = ? AND archived = 1 AND upstream_updated_at < ?",
        )
        .bind(user_id.to_string())
        .bind(older_than)
        .execute(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to prune notifications: {err}");
            db_error(err, message)
        })?;
        Ok(result.rows_affected())
    }
}

impl Repository {
    async fn get_notification_row(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<Option<Notification>, ForgeInboxError> {
        let row = sqlx::query_as::<_, NotificationRow>(
            "SELECT * FROM notification WHERE id = ? AND user_id = ?",
        )
        .bind(notification_id.0)
        .bind(user_id.to_string())
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch notification {notification_id}: {err}");
            db_error(err, message)
        })?;
        row.map(|row| row.try_into()).transpose()
    }

    async fn apply_tag_action_by_ids(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        notification_ids: &[NotificationId],
        tag_id: TagId,
        assign: bool,
    ) -> Result<u64, ForgeInboxError> {
        let mut builder = if assign {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "INSERT INTO tag_assignment (tag_id, entity_type, entity_id) VALUES ",
            );
            let mut separated = builder.separated(", ");
            for id in notification_ids {
                separated
                    .push("(")
                    .push_bind_unseparated(tag_id.to_string())
                    .push_unseparated(", 'notification', ")
                    .push_bind_unseparated(id.0)
                    .push_unseparated(")");
            }
            builder.push(" ON CONFLICT DO NOTHING");
            builder
        } else {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "DELETE FROM tag_assignment WHERE tag_id = ",
            );
            builder.push_bind(tag_id.to_string());
            builder.push(" AND entity_type = 'notification' AND entity_id IN (");
            let mut separated = builder.separated(", ");
            for id in notification_ids {
                separated.push_bind(id.0);
            }
            builder.push(")");
            builder
        };

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update tag assignments: {err}");
                db_error(err, message)
            })?;
        Ok(result.rows_affected())
    }
}

fn tag_action(action: &NotificationAction) -> Option<(TagId, bool)> {
    match action {
        NotificationAction::AssignTag { tag_id } => Some((*tag_id, true)),
        NotificationAction::RemoveTag { tag_id } => Some((*tag_id, false)),
        _ => None,
    }
}

/// SET clause for a lifecycle action; snooze binds its deadline twice
/// (flag and sort date).
fn action_set_clause(action: &NotificationAction) -> &'static str {
    match action {
        NotificationAction::MarkRead => "is_read = 1",
        NotificationAction::MarkUnread => "is_read = 0",
        NotificationAction::Archive => "archived = 1",
        NotificationAction::Unarchive => "archived = 0",
        NotificationAction::Mute => "muted = 1",
        NotificationAction::Unmute => "muted = 0",
        NotificationAction::Star => "starred = 1",
        NotificationAction::Unstar => "starred = 0",
        NotificationAction::Snooze { .. } => "snoozed_until = ?, effective_sort_date = ?",
        NotificationAction::Unsnooze => {
            "snoozed_until = NULL, effective_sort_date = upstream_updated_at"
        }
        NotificationAction::Filter => "filtered = 1",
        NotificationAction::Unfilter => "filtered = 0",
        NotificationAction::AssignTag { .. } | NotificationAction::RemoveTag { .. } => {
            unreachable!("tag actions do not update the notification row")
        }
    }
}

fn bind_action_args<'q, O>(
    query: sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    action: &NotificationAction,
) -> sqlx::query::QueryAs<'q, Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    match action {
        NotificationAction::Snooze { until } => query.bind(*until).bind(*until),
        _ => query,
    }
}

fn bind_action_args_plain<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    action: &NotificationAction,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match action {
        NotificationAction::Snooze { until } => query.bind(*until).bind(*until),
        _ => query,
    }
}

const JOINED_COLUMNS: &str = "\
    notification.id AS n_id, \
    notification.user_id AS n_user_id, \
    notification.upstream_id AS n_upstream_id, \
    notification.repo_id AS n_repo_id, \
    notification.subject_kind AS n_subject_kind, \
    notification.subject_title AS n_subject_title, \
    notification.subject_number AS n_subject_number, \
    notification.subject_state AS n_subject_state, \
    notification.subject_merged AS n_subject_merged, \
    notification.subject_state_reason AS n_subject_state_reason, \
    notification.subject_raw AS n_subject_raw, \
    notification.reason AS n_reason, \
    notification.author_login AS n_author_login, \
    notification.is_read AS n_is_read, \
    notification.archived AS n_archived, \
    notification.muted AS n_muted, \
    notification.starred AS n_starred, \
    notification.filtered AS n_filtered, \
    notification.snoozed_until AS n_snoozed_until, \
    notification.effective_sort_date AS n_effective_sort_date, \
    notification.upstream_updated_at AS n_upstream_updated_at, \
    notification.imported_at AS n_imported_at, \
    repo.id AS r_id, \
    repo.user_id AS r_user_id, \
    repo.upstream_id AS r_upstream_id, \
    repo.full_name AS r_full_name, \
    repo.owner_login AS r_owner_login, \
    repo.private AS r_private, \
    repo.default_branch AS r_default_branch, \
    repo.updated_at AS r_updated_at";

#[derive(Debug, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: String,
    pub upstream_id: String,
    pub repo_id: String,
    pub subject_kind: String,
    pub subject_title: String,
    pub subject_number: Option<i64>,
    pub subject_state: Option<String>,
    pub subject_merged: Option<bool>,
    pub subject_state_reason: Option<String>,
    pub subject_raw: Option<String>,
    pub reason: String,
    pub author_login: Option<String>,
    pub is_read: bool,
    pub archived: bool,
    pub muted: bool,
    pub starred: bool,
    pub filtered: bool,
    pub snoozed_until: Option<DateTime<Utc>>,
    pub effective_sort_date: DateTime<Utc>,
    pub upstream_updated_at: DateTime<Utc>,
    pub imported_at: DateTime<Utc>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = ForgeInboxError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        let raw = row
            .subject_raw
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Invalid subject payload in storage")?;
        Ok(Notification {
            id: NotificationId(row.id),
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            upstream_id: row.upstream_id,
            repo_id: row
                .repo_id
                .parse::<uuid::Uuid>()
                .map(RepoId::from)
                .context("Invalid repository id in storage")?,
            subject: Subject {
                kind: SubjectType::from_kind(&row.subject_kind),
                title: row.subject_title,
                number: row.subject_number,
                state: row.subject_state,
                merged: row.subject_merged,
                state_reason: row.subject_state_reason,
                raw,
            },
            reason: row.reason,
            author_login: row.author_login,
            is_read: row.is_read,
            archived: row.archived,
            muted: row.muted,
            starred: row.starred,
            filtered: row.filtered,
            snoozed_until: row.snoozed_until,
            effective_sort_date: row.effective_sort_date,
            upstream_updated_at: row.upstream_updated_at,
            imported_at: row.imported_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct NotificationWithRepoRow {
    n_id: i64,
    n_user_id: String,
    n_upstream_id: String,
    n_repo_id: String,
    n_subject_kind: String,
    n_subject_title: String,
    n_subject_number: Option<i64>,
    n_subject_state: Option<String>,
    n_subject_merged: Option<bool>,
    n_subject_state_reason: Option<String>,
    n_subject_raw: Option<String>,
    n_reason: String,
    n_author_login: Option<String>,
    n_is_read: bool,
    n_archived: bool,
    n_muted: bool,
    n_starred: bool,
    n_filtered: bool,
    n_snoozed_until: Option<DateTime<Utc>>,
    n_effective_sort_date: DateTime<Utc>,
    n_upstream_updated_at: DateTime<Utc>,
    n_imported_at: DateTime<Utc>,
    r_id: String,
    r_user_id: String,
    r_upstream_id: String,
    r_full_name: String,
    r_owner_login: String,
    r_private: bool,
    r_default_branch: Option<String>,
    r_updated_at: DateTime<Utc>,
}

impl TryFrom<NotificationWithRepoRow> for NotificationWithRepo {
    type Error = ForgeInboxError;

    fn try_from(row: NotificationWithRepoRow) -> Result<Self, Self::Error> {
        let notification = NotificationRow {
            id: row.n_id,
            user_id: row.n_user_id,
            upstream_id: row.n_upstream_id,
            repo_id: row.n_repo_id,
            subject_kind: row.n_subject_kind,
            subject_title: row.n_subject_title,
            subject_number: row.n_subject_number,
            subject_state: row.n_subject_state,
            subject_merged: row.n_subject_merged,
            subject_state_reason: row.n_subject_state_reason,
            subject_raw: row.n_subject_raw,
            reason: row.n_reason,
            author_login: row.n_author_login,
            is_read: row.n_is_read,
            archived: row.n_archived,
            muted: row.n_muted,
            starred: row.n_starred,
            filtered: row.n_filtered,
            snoozed_until: row.n_snoozed_until,
            effective_sort_date: row.n_effective_sort_date,
            upstream_updated_at: row.n_upstream_updated_at,
            imported_at: row.n_imported_at,
        }
        .try_into()?;
        let repo: Repo = RepoRow {
            id: row.r_id,
            user_id: row.r_user_id,
            upstream_id: row.r_upstream_id,
            full_name: row.r_full_name,
            owner_login: row.r_owner_login,
            private: row.r_private,
            default_branch: row.r_default_branch,
            updated_at: row.r_updated_at,
        }
        .try_into()?;

        Ok(NotificationWithRepo {
            notification,
            repo,
            tags: vec![],
        })
    }
}

#[derive(Debug, FromRow)]
struct TaggedEntityRow {
    entity_id: i64,
    #[sqlx(flatten)]
    tag: TagRow,
}
