use std::sync::Arc;

use chrono::Utc;

use forge_inbox::{
    query::QueryError,
    tag::{is_reserved_slug, slugify, Tag},
    TagId, UserId,
};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{
        commit,
        tag::{TagPatch, TagRepository},
        Repository,
    },
};

#[derive(Debug, Clone)]
pub struct CreateTagRequest {
    pub name: String,
    pub color: Option<String>,
}

pub struct TagService {
    repository: Arc<Repository>,
}

impl TagService {
    pub fn new(repository: Arc<Repository>) -> TagService {
        TagService { repository }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn list_tags(&self, user_id: UserId) -> Result<Vec<Tag>, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        self.repository.list_tags(&mut transaction, user_id).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(name = request.name), err)]
    pub async fn create_tag(
        &self,
        request: CreateTagRequest,
        user_id: UserId,
    ) -> Result<Tag, ForgeInboxError> {
        let slug = validate_tag_name(&request.name)?;

        let mut transaction = self.repository.begin().await?;
        let now = Utc::now();
        let tag = self
            .repository
            .create_tag(
                &mut transaction,
                Tag {
                    id: TagId::new(),
                    user_id,
                    name: request.name,
                    slug,
                    color: request.color,
                    display_order: 0,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;
        commit(transaction).await?;
        Ok(tag)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(tag_id = tag_id.to_string()), err)]
    pub async fn update_tag(
        &self,
        tag_id: TagId,
        name: Option<String>,
        color: Option<Option<String>>,
        user_id: UserId,
    ) -> Result<Tag, ForgeInboxError> {
        let slug = name.as_deref().map(validate_tag_name).transpose()?;

        let mut transaction = self.repository.begin().await?;
        let tag = self
            .repository
            .update_tag(
                &mut transaction,
                tag_id,
                &TagPatch { name, slug, color },
                user_id,
            )
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("Tag {tag_id} not found")))?;
        commit(transaction).await?;
        Ok(tag)
    }

    /// Deleting a tag cascades over its assignments; notifications lose the
    /// label but are otherwise untouched.
    #[tracing::instrument(level = "debug", skip(self), fields(tag_id = tag_id.to_string()), err)]
    pub async fn delete_tag(&self, tag_id: TagId, user_id: UserId) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let deleted = self
            .repository
            .delete_tag(&mut transaction, tag_id, user_id)
            .await?;
        if !deleted {
            return Err(ForgeInboxError::ItemNotFound(format!(
                "Tag {tag_id} not found"
            )));
        }
        commit(transaction).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(count = ordered_ids.len()), err)]
    pub async fn reorder_tags(
        &self,
        ordered_ids: &[TagId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        for tag_id in ordered_ids {
            self.repository
                .get_tag(&mut transaction, *tag_id, user_id)
                .await?
                .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("Tag {tag_id} not found")))?;
        }
        self.repository
            .reorder_tags(&mut transaction, ordered_ids, user_id)
            .await?;
        commit(transaction).await
    }
}

fn validate_tag_name(name: &str) -> Result<String, ForgeInboxError> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "Tag name must contain at least one alphanumeric character".to_string(),
        });
    }
    if is_reserved_slug(&slug) {
        return Err(ForgeInboxError::InvalidQuery(QueryError::ReservedSlug {
            slug,
        }));
    }
    Ok(slug)
}
