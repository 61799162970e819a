use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use chrono::Utc;

use forge_inbox::{
    query::{
        ast::{Expr, Term},
        overlay::{inbox_term, with_overlay},
        parse_optional, Field, QueryError,
    },
    tag::slugify,
    view::{builtin_view, View, ViewWithCount, BUILTIN_VIEWS, RESERVED_SLUGS},
    UserId, ViewId,
};

use crate::{
    forge_inbox::{query_cache, ForgeInboxError},
    repository::{
        rule::RuleRepository,
        search::translate,
        view::{ViewPatch, ViewRepository},
        Repository,
    },
};

use crate::repository::notification::NotificationRepository;

#[derive(Debug, Clone)]
pub struct CreateViewRequest {
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub query: String,
    pub is_default: bool,
}

/// Outcome of a view delete: either deleted, or blocked by linked rules
/// when `force` was not set.
#[derive(Debug, PartialEq, Eq)]
pub enum DeleteViewOutcome {
    Deleted,
    LinkedRules { linked_rule_count: usize },
}

/// Per-user unread-count cache. Counts are recomputed on demand and kept
/// for a short TTL to coalesce bursts of UI refreshes; any user mutation
/// invalidates the whole user's entries.
#[derive(Debug)]
pub struct CountCache {
    ttl: Duration,
    entries: Mutex<HashMap<(UserId, String), (i64, Instant)>>,
}

impl CountCache {
    pub fn new(ttl: Duration) -> CountCache {
        CountCache {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, user_id: UserId, query: &str) -> Option<i64> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.lock().expect("count cache lock poisoned");
        let (count, stored_at) = entries.get(&(user_id, query.to_string()))?;
        (stored_at.elapsed() < self.ttl).then_some(*count)
    }

    fn put(&self, user_id: UserId, query: &str, count: i64) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries
            .lock()
            .expect("count cache lock poisoned")
            .insert((user_id, query.to_string()), (count, Instant::now()));
    }

    pub fn invalidate_user(&self, user_id: UserId) {
        self.entries
            .lock()
            .expect("count cache lock poisoned")
            .retain(|(cached_user, _), _| *cached_user != user_id);
    }
}

pub struct ViewService {
    repository: Arc<Repository>,
    count_cache: Arc<CountCache>,
}

impl ViewService {
    pub fn new(repository: Arc<Repository>, count_cache: Arc<CountCache>) -> ViewService {
        ViewService {
            repository,
            count_cache,
        }
    }

    /// Built-in views first, then user views, every one with its live
    /// unread count.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn list_views(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ViewWithCount>, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let user_views = self.repository.list_views(&mut transaction, user_id).await?;

        let mut views = Vec::with_capacity(BUILTIN_VIEWS.len() + user_views.len());
        for builtin in &BUILTIN_VIEWS {
            let unread_count = self
                .unread_count(&mut transaction, builtin.query, user_id)
                .await?;
            views.push(ViewWithCount {
                id: ViewId::builtin(builtin.id),
                name: builtin.name.to_string(),
                slug: builtin.id.to_string(),
                description: None,
                icon: Some(builtin.icon.to_string()),
                query: builtin.query.to_string(),
                display_order: builtin.display_order,
                is_default: builtin.id == "inbox",
                builtin: true,
                unread_count,
            });
        }
        for view in user_views {
            let unread_count = self
                .unread_count(&mut transaction, &view.query, user_id)
                .await?;
            views.push(ViewWithCount {
                id: view.id,
                name: view.name,
                slug: view.slug,
                description: view.description,
                icon: view.icon,
                query: view.query,
                display_order: view.display_order,
                is_default: view.is_default,
                builtin: false,
                unread_count,
            });
        }

        crate::repository::commit(transaction).await?;
        Ok(views)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn get_view(
        &self,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<View, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        self.resolve_view(&mut transaction, view_id, user_id).await
    }

    /// Resolves a view id to its definition, covering both builtin ids and
    /// stored user views. Used by the rules engine to resolve `view_id`
    /// predicates without holding view objects.
    pub async fn resolve_view(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<View, ForgeInboxError> {
        if let Some(builtin) = builtin_view(view_id.as_str()) {
            let now = Utc::now();
            return Ok(View {
                id: ViewId::builtin(builtin.id),
                user_id,
                name: builtin.name.to_string(),
                slug: builtin.id.to_string(),
                description: None,
                icon: Some(builtin.icon.to_string()),
                query: builtin.query.to_string(),
                display_order: builtin.display_order,
                is_default: builtin.id == "inbox",
                created_at: now,
                updated_at: now,
            });
        }
        self.repository
            .get_view(transaction, view_id, user_id)
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("View {view_id} not found")))
    }

    #[tracing::instrument(level = "debug", skip(self), fields(name = request.name), err)]
    pub async fn create_view(
        &self,
        request: CreateViewRequest,
        user_id: UserId,
    ) -> Result<View, ForgeInboxError> {
        let slug = slugify(&request.name);
        validate_slug(&slug)?;
        validate_query(&request.query)?;

        let mut transaction = self.repository.begin().await?;
        let display_order = self
            .repository
            .next_view_display_order(&mut transaction, user_id)
            .await?;
        let now = Utc::now();
        let view = self
            .repository
            .create_view(
                &mut transaction,
                View {
                    id: ViewId::new(),
                    user_id,
                    name: request.name,
                    slug,
                    description: request.description,
                    icon: request.icon,
                    query: request.query,
                    display_order,
                    is_default: request.is_default,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;
        crate::repository::commit(transaction).await?;

        query_cache::flush();
        self.count_cache.invalidate_user(user_id);
        Ok(view)
    }

    #[tracing::instrument(level = "debug", skip(self, patch), fields(view_id = view_id.to_string()), err)]
    pub async fn update_view(
        &self,
        view_id: &ViewId,
        mut patch: ViewPatch,
        user_id: UserId,
    ) -> Result<View, ForgeInboxError> {
        if builtin_view(view_id.as_str()).is_some() {
            return Err(ForgeInboxError::InvalidInputData {
                source: None,
                user_error: "Built-in views cannot be modified".to_string(),
            });
        }
        if let Some(name) = &patch.name {
            let slug = slugify(name);
            validate_slug(&slug)?;
            patch.slug = Some(slug);
        }
        if let Some(query) = &patch.query {
            validate_query(query)?;
        }

        let mut transaction = self.repository.begin().await?;
        let view = self
            .repository
            .update_view(&mut transaction, view_id, &patch, user_id)
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("View {view_id} not found")))?;
        crate::repository::commit(transaction).await?;

        query_cache::flush();
        self.count_cache.invalidate_user(user_id);
        Ok(view)
    }

    /// Without `force`, a view with linked rules is left untouched and the
    /// caller gets the link count back; with it, the linked rules are
    /// deleted in the same transaction.
    #[tracing::instrument(level = "debug", skip(self), fields(view_id = view_id.to_string()), err)]
    pub async fn delete_view(
        &self,
        view_id: &ViewId,
        force: bool,
        user_id: UserId,
    ) -> Result<DeleteViewOutcome, ForgeInboxError> {
        if builtin_view(view_id.as_str()).is_some() {
            return Err(ForgeInboxError::InvalidInputData {
                source: None,
                user_error: "Built-in views cannot be deleted".to_string(),
            });
        }

        let mut transaction = self.repository.begin().await?;
        let linked_rules = self
            .repository
            .list_rules_for_view(&mut transaction, view_id, user_id)
            .await?;
        if !linked_rules.is_empty() && !force {
            return Ok(DeleteViewOutcome::LinkedRules {
                linked_rule_count: linked_rules.len(),
            });
        }
        for rule in &linked_rules {
            self.repository
                .delete_rule(&mut transaction, rule.id, user_id)
                .await?;
        }
        let deleted = self
            .repository
            .delete_view(&mut transaction, view_id, user_id)
            .await?;
        if !deleted {
            return Err(ForgeInboxError::ItemNotFound(format!(
                "View {view_id} not found"
            )));
        }
        crate::repository::commit(transaction).await?;

        query_cache::flush();
        self.count_cache.invalidate_user(user_id);
        Ok(DeleteViewOutcome::Deleted)
    }

    /// Validates every id (existing, non-reserved) before rewriting the
    /// display order space in one transaction.
    #[tracing::instrument(level = "debug", skip(self), fields(count = ordered_ids.len()), err)]
    pub async fn reorder_views(
        &self,
        ordered_ids: &[ViewId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        for view_id in ordered_ids {
            if builtin_view(view_id.as_str()).is_some() {
                return Err(ForgeInboxError::InvalidInputData {
                    source: None,
                    user_error: "Built-in views cannot be reordered".to_string(),
                });
            }
            self.repository
                .get_view(&mut transaction, view_id, user_id)
                .await?
                .ok_or_else(|| {
                    ForgeInboxError::ItemNotFound(format!("View {view_id} not found"))
                })?;
        }
        self.repository
            .reorder_views(&mut transaction, ordered_ids, user_id)
            .await?;
        crate::repository::commit(transaction).await?;
        Ok(())
    }

    /// A view's unread count: the view query AND `is:unread`, run through
    /// the overlay, counted by the store. Served from the TTL cache when
    /// fresh.
    pub async fn unread_count(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        query: &str,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError> {
        if let Some(count) = self.count_cache.get(user_id, query) {
            return Ok(count);
        }

        let expr = unread_count_expr(query)?;
        let translated = translate(&expr, Utc::now(), 1, 0);
        let count = self
            .repository
            .count_notifications_from_query(transaction, &translated, user_id)
            .await?;

        self.count_cache.put(user_id, query, count);
        Ok(count)
    }

    pub fn invalidate_counts(&self, user_id: UserId) {
        self.count_cache.invalidate_user(user_id);
    }
}

fn unread_count_expr(query: &str) -> Result<Expr, QueryError> {
    let base = parse_optional(query)?.unwrap_or_else(inbox_term);
    let unread = Expr::Term(Term {
        field: Field::Is,
        values: vec!["unread".to_string()],
        negated: false,
    });
    Ok(with_overlay(Some(Expr::and(base, unread))))
}

fn validate_slug(slug: &str) -> Result<(), ForgeInboxError> {
    if slug.is_empty() {
        return Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "View name must contain at least one alphanumeric character".to_string(),
        });
    }
    if RESERVED_SLUGS.contains(&slug) {
        return Err(ForgeInboxError::InvalidQuery(QueryError::ReservedSlug {
            slug: slug.to_string(),
        }));
    }
    Ok(())
}

fn validate_query(query: &str) -> Result<(), ForgeInboxError> {
    // A blank view query is allowed and means the inbox.
    parse_optional(query)?;
    Ok(())
}
