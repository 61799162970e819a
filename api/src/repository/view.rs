use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};

use forge_inbox::{view::View, UserId, ViewId};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{classify_db_error, db_error, Repository},
};

#[derive(Debug, Clone, Default)]
pub struct ViewPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<Option<String>>,
    pub icon: Option<Option<String>>,
    pub query: Option<String>,
    pub is_default: Option<bool>,
}

#[async_trait]
pub trait ViewRepository {
    async fn list_views(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<Vec<View>, ForgeInboxError>;

    async fn get_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<Option<View>, ForgeInboxError>;

    async fn create_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view: View,
    ) -> Result<View, ForgeInboxError>;

    async fn update_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        patch: &ViewPatch,
        user_id: UserId,
    ) -> Result<Option<View>, ForgeInboxError>;

    async fn delete_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError>;

    async fn next_view_display_order(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError>;

    async fn reorder_views(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[ViewId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError>;
}

#[async_trait]
impl ViewRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn list_views(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<Vec<View>, ForgeInboxError> {
        let rows = sqlx::query_as::<_, ViewRow>(
            "SELECT * FROM saved_view WHERE user_id = ? ORDER BY display_order, name",
        )
        .bind(user_id.to_string())
        .fetch_all(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to list views: {err}");
            db_error(err, message)
        })?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = view_id.to_string()), err)]
    async fn get_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<Option<View>, ForgeInboxError> {
        let row = sqlx::query_as::<_, ViewRow>(
            "SELECT * FROM saved_view WHERE id = ? AND user_id = ?",
        )
        .bind(view_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch view {view_id}: {err}");
            db_error(err, message)
        })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(slug = view.slug), err)]
    async fn create_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view: View,
    ) -> Result<View, ForgeInboxError> {
        let row = sqlx::query_as::<_, ViewRow>(
            r#"
                INSERT INTO saved_view
                  (id, user_id, name, slug, description, icon, query,
                   display_order, is_default, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(view.id.to_string())
        .bind(view.user_id.to_string())
        .bind(&view.name)
        .bind(&view.slug)
        .bind(&view.description)
        .bind(&view.icon)
        .bind(&view.query)
        .bind(view.display_order)
        .bind(view.is_default)
        .bind(view.created_at)
        .bind(view.updated_at)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to create view {}: {err}", view.slug);
            classify_db_error(err, &view.slug, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = view_id.to_string()), err)]
    async fn update_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        patch: &ViewPatch,
        user_id: UserId,
    ) -> Result<Option<View>, ForgeInboxError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE saved_view SET updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(name) = &patch.name {
            builder.push(", name = ");
            builder.push_bind(name.clone());
        }
        if let Some(slug) = &patch.slug {
            builder.push(", slug = ");
            builder.push_bind(slug.clone());
        }
        if let Some(description) = &patch.description {
            builder.push(", description = ");
            builder.push_bind(description.clone());
        }
        if let Some(icon) = &patch.icon {
            builder.push(", icon = ");
            builder.push_bind(icon.clone());
        }
        if let Some(query) = &patch.query {
            builder.push(", query = ");
            builder.push_bind(query.clone());
        }
        if let Some(is_default) = patch.is_default {
            builder.push(", is_default = ");
            builder.push_bind(is_default);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(view_id.to_string());
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.to_string());
        builder.push(" RETURNING *");

        let row = builder
            .build_query_as::<ViewRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update view {view_id}: {err}");
                classify_db_error(err, patch.slug.as_deref().unwrap_or("view"), message)
            })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = view_id.to_string()), err)]
    async fn delete_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query("DELETE FROM saved_view WHERE id = ? AND user_id = ?")
            .bind(view_id.to_string())
            .bind(user_id.to_string())
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete view {view_id}: {err}");
                db_error(err, message)
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn next_view_display_order(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT max(display_order) FROM saved_view WHERE user_id = ?",
        )
        .bind(user_id.to_string())
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to compute next view display order: {err}");
            db_error(err, message)
        })?;
        Ok(max.unwrap_or(0) + forge_inbox::view::VIEW_DISPLAY_ORDER_STEP)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_views(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[ViewId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        for (position, view_id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE saved_view SET display_order = ? WHERE id = ? AND user_id = ?")
                .bind((position as i64 + 1) * forge_inbox::view::VIEW_DISPLAY_ORDER_STEP)
                .bind(view_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to reorder view {view_id}: {err}");
                    db_error(err, message)
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
pub struct ViewRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub query: String,
    pub display_order: i64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ViewRow> for View {
    type Error = ForgeInboxError;

    fn try_from(row: ViewRow) -> Result<Self, Self::Error> {
        Ok(View {
            id: ViewId::from(row.id),
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            name: row.name,
            slug: row.slug,
            description: row.description,
            icon: row.icon,
            query: row.query,
            display_order: row.display_order,
            is_default: row.is_default,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
