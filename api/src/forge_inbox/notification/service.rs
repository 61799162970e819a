use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::Utc;

use forge_inbox::{
    hints::{dismissing_actions, HintAction},
    notification::{NotificationAction, NotificationWithRepo},
    query::{overlay::with_overlay, parse_optional},
    NotificationId, Page, UserId, DEFAULT_PAGE_SIZE,
};

use crate::{
    forge_inbox::{view::service::CountCache, ForgeInboxError},
    repository::{
        commit,
        notification::NotificationRepository,
        search::{translate, NotificationQuery},
        Repository,
    },
};

/// Target of a bulk operation: an explicit id list or everything matching
/// a query.
#[derive(Debug, Clone)]
pub enum BulkTarget {
    Ids(Vec<NotificationId>),
    Query(String),
}

pub struct NotificationService {
    repository: Arc<Repository>,
    count_cache: Arc<CountCache>,
    /// Per-notification advisory locks serialising concurrent single-row
    /// user actions. Held only for the duration of one mutation.
    row_locks: Mutex<HashMap<NotificationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl NotificationService {
    pub fn new(repository: Arc<Repository>, count_cache: Arc<CountCache>) -> NotificationService {
        NotificationService {
            repository,
            count_cache,
            row_locks: Mutex::new(HashMap::new()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn list_notifications(
        &self,
        query: &str,
        page: usize,
        page_size: Option<usize>,
        user_id: UserId,
    ) -> Result<Page<NotificationWithRepo>, ForgeInboxError> {
        let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let expr = with_overlay(parse_optional(query)?);
        let translated = translate(
            &expr,
            Utc::now(),
            page_size as i64,
            (page.saturating_sub(1) * page_size) as i64,
        );

        let mut transaction = self.repository.begin().await?;
        self.repository
            .list_notifications_from_query(&mut transaction, &translated, user_id)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(notification_id = notification_id.to_string()), err)]
    pub async fn get_notification(
        &self,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<NotificationWithRepo, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        self.repository
            .get_notification(&mut transaction, notification_id, user_id)
            .await?
            .ok_or_else(|| {
                ForgeInboxError::ItemNotFound(format!(
                    "Notification {notification_id} not found"
                ))
            })
    }

    /// Applies one user action to one notification. `filter` is a
    /// rules-only action and is rejected here.
    #[tracing::instrument(level = "debug", skip(self), fields(notification_id = notification_id.to_string()), err)]
    pub async fn apply_action(
        &self,
        notification_id: NotificationId,
        action: NotificationAction,
        user_id: UserId,
    ) -> Result<NotificationWithRepo, ForgeInboxError> {
        validate_user_action(&action)?;

        let row_lock = self.row_lock(notification_id);
        let _guard = row_lock.lock().await;

        let mut transaction = self.repository.begin().await?;
        let updated = self
            .repository
            .apply_action(&mut transaction, notification_id, &action, user_id)
            .await?;
        if updated.is_none() {
            return Err(ForgeInboxError::ItemNotFound(format!(
                "Notification {notification_id} not found"
            )));
        }
        commit(transaction).await?;
        self.count_cache.invalidate_user(user_id);

        self.get_notification(notification_id, user_id).await
    }

    /// One bulk operation, atomically applied to the whole target set in a
    /// single transaction. Query targets never materialise the result set
    /// into the process.
    #[tracing::instrument(level = "debug", skip(self, target), err)]
    pub async fn bulk_apply(
        &self,
        target: BulkTarget,
        action: NotificationAction,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError> {
        validate_user_action(&action)?;

        let mut transaction = self.repository.begin().await?;
        let affected = match target {
            BulkTarget::Ids(ids) => {
                self.repository
                    .apply_action_by_ids(&mut transaction, &ids, &action, user_id)
                    .await?
            }
            BulkTarget::Query(query) => {
                let translated = self.translate_bulk_query(&query)?;
                self.repository
                    .apply_action_by_query(&mut transaction, &translated, &action, user_id)
                    .await?
            }
        };
        commit(transaction).await?;
        self.count_cache.invalidate_user(user_id);
        Ok(affected)
    }

    /// The actions that would dismiss this notification from the given
    /// view query, computed in-process against the current row.
    #[tracing::instrument(level = "debug", skip(self), fields(notification_id = notification_id.to_string()), err)]
    pub async fn action_hints(
        &self,
        notification_id: NotificationId,
        view_query: &str,
        user_id: UserId,
    ) -> Result<Vec<HintAction>, ForgeInboxError> {
        let with_repo = self.get_notification(notification_id, user_id).await?;
        let expr = with_overlay(parse_optional(view_query)?);
        Ok(dismissing_actions(
            &expr,
            &with_repo.notification,
            &with_repo.repo,
            &with_repo.tags,
            Utc::now(),
        ))
    }

    fn translate_bulk_query(&self, query: &str) -> Result<NotificationQuery, ForgeInboxError> {
        let expr = with_overlay(parse_optional(query)?);
        Ok(translate(&expr, Utc::now(), i64::MAX, 0))
    }

    fn row_lock(&self, notification_id: NotificationId) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks
            .lock()
            .expect("row lock table poisoned")
            .entry(notification_id)
            .or_default()
            .clone()
    }
}

fn validate_user_action(action: &NotificationAction) -> Result<(), ForgeInboxError> {
    match action {
        NotificationAction::Filter => Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "The filter action is applied by rules only".to_string(),
        }),
        NotificationAction::Snooze { until } if *until <= Utc::now() => {
            Err(ForgeInboxError::InvalidInputData {
                source: None,
                user_error: "snoozed_until must be in the future".to_string(),
            })
        }
        _ => Ok(()),
    }
}
