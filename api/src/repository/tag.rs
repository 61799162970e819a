use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};

use forge_inbox::{tag::Tag, TagId, UserId};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{classify_db_error, db_error, Repository},
};

#[derive(Debug, Clone)]
pub struct TagPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub color: Option<Option<String>>,
}

#[async_trait]
pub trait TagRepository {
    async fn list_tags(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<Vec<Tag>, ForgeInboxError>;

    async fn get_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        user_id: UserId,
    ) -> Result<Option<Tag>, ForgeInboxError>;

    async fn create_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag: Tag,
    ) -> Result<Tag, ForgeInboxError>;

    async fn update_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        patch: &TagPatch,
        user_id: UserId,
    ) -> Result<Option<Tag>, ForgeInboxError>;

    async fn delete_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError>;

    /// Rewrites the display order of every given tag in one transaction.
    async fn reorder_tags(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[TagId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError>;
}

#[async_trait]
impl TagRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn list_tags(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<Vec<Tag>, ForgeInboxError> {
        let rows = sqlx::query_as::<_, TagRow>(
            "SELECT * FROM tag WHERE user_id = ? ORDER BY display_order, name",
        )
        .bind(user_id.to_string())
        .fetch_all(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to list tags: {err}");
            db_error(err, message)
        })?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = tag_id.to_string()), err)]
    async fn get_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        user_id: UserId,
    ) -> Result<Option<Tag>, ForgeInboxError> {
        let row =
            sqlx::query_as::<_, TagRow>("SELECT * FROM tag WHERE id = ? AND user_id = ?")
                .bind(tag_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to fetch tag {tag_id}: {err}");
                    db_error(err, message)
                })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = tag.name), err)]
    async fn create_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag: Tag,
    ) -> Result<Tag, ForgeInboxError> {
        let row = sqlx::query_as::<_, TagRow>(
            r#"
                INSERT INTO tag
                  (id, user_id, name, slug, color, display_order, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(tag.id.to_string())
        .bind(tag.user_id.to_string())
        .bind(&tag.name)
        .bind(&tag.slug)
        .bind(&tag.color)
        .bind(tag.display_order)
        .bind(tag.created_at)
        .bind(tag.updated_at)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to create tag {}: {err}", tag.name);
            classify_db_error(err, &tag.name, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = tag_id.to_string()), err)]
    async fn update_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        patch: &TagPatch,
        user_id: UserId,
    ) -> Result<Option<Tag>, ForgeInboxError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE tag SET updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(name) = &patch.name {
            builder.push(", name = ");
            builder.push_bind(name.clone());
        }
        if let Some(slug) = &patch.slug {
            builder.push(", slug = ");
            builder.push_bind(slug.clone());
        }
        if let Some(color) = &patch.color {
            builder.push(", color = ");
            builder.push_bind(color.clone());
        }
        builder.push(" WHERE id = ");
        builder.push_bind(tag_id.to_string());
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.to_string());
        builder.push(" RETURNING *");

        let row = builder
            .build_query_as::<TagRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update tag {tag_id}: {err}");
                classify_db_error(err, patch.name.as_deref().unwrap_or("tag"), message)
            })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = tag_id.to_string()), err)]
    async fn delete_tag(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        tag_id: TagId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query("DELETE FROM tag WHERE id = ? AND user_id = ?")
            .bind(tag_id.to_string())
            .bind(user_id.to_string())
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete tag {tag_id}: {err}");
                db_error(err, message)
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_tags(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[TagId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        for (position, tag_id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE tag SET display_order = ? WHERE id = ? AND user_id = ?")
                .bind(((position + 1) * 100) as i64)
                .bind(tag_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to reorder tag {tag_id}: {err}");
                    db_error(err, message)
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
pub struct TagRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub slug: String,
    pub color: Option<String>,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TagRow> for Tag {
    type Error = ForgeInboxError;

    fn try_from(row: TagRow) -> Result<Self, Self::Error> {
        Ok(Tag {
            id: row
                .id
                .parse::<uuid::Uuid>()
                .map(TagId::from)
                .context("Invalid tag id in storage")?,
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            name: row.name,
            slug: row.slug,
            color: row.color,
            display_order: row.display_order,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
