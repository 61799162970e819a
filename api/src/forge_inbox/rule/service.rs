use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use chrono::Utc;
use tracing::warn;

use forge_inbox::{
    notification::{NotificationAction, NotificationWithRepo},
    query::{eval::EvalContext, overlay::with_overlay, parse, Expr},
    rule::{Rule, RuleActions},
    NotificationId, RuleId, UserId, ViewId,
};

use crate::{
    forge_inbox::{
        query_cache,
        view::service::{CountCache, ViewService},
        ForgeInboxError,
    },
    jobs::{encode_payload, BackfillJob, JobKind},
    repository::{
        commit,
        job::{JobRepository, NewJob},
        notification::NotificationRepository,
        rule::{RulePatch, RuleRepository},
        search::translate,
        tag::TagRepository,
        Repository,
    },
};

const RETRO_APPLY_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone)]
pub struct CreateRuleRequest {
    pub name: String,
    pub query: Option<String>,
    pub view_id: Option<ViewId>,
    pub actions: RuleActions,
    pub enabled: bool,
    pub apply_to_existing: bool,
}

pub struct RuleService {
    repository: Arc<Repository>,
    view_service: Arc<ViewService>,
    count_cache: Arc<CountCache>,
    /// Rules whose predicate stopped compiling are sidelined for this
    /// process lifetime instead of deleted.
    disabled_rules: Mutex<HashSet<RuleId>>,
    max_job_attempts: i64,
}

impl RuleService {
    pub fn new(
        repository: Arc<Repository>,
        view_service: Arc<ViewService>,
        count_cache: Arc<CountCache>,
        max_job_attempts: i64,
    ) -> RuleService {
        RuleService {
            repository,
            view_service,
            count_cache,
            disabled_rules: Mutex::new(HashSet::new()),
            max_job_attempts,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn list_rules(&self, user_id: UserId) -> Result<Vec<Rule>, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        self.repository
            .list_rules(&mut transaction, false, user_id)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(name = request.name), err)]
    pub async fn create_rule(
        &self,
        request: CreateRuleRequest,
        user_id: UserId,
    ) -> Result<Rule, ForgeInboxError> {
        validate_rule_definition(request.query.as_deref(), request.view_id.as_ref())?;
        validate_rule_actions(&request.actions)?;

        let mut transaction = self.repository.begin().await?;
        if let Some(view_id) = &request.view_id {
            self.view_service
                .resolve_view(&mut transaction, view_id, user_id)
                .await?;
        }
        let display_order = self
            .repository
            .next_rule_display_order(&mut transaction, user_id)
            .await?;
        let now = Utc::now();
        let rule = self
            .repository
            .create_rule(
                &mut transaction,
                Rule {
                    id: RuleId::new(),
                    user_id,
                    name: request.name,
                    query: request.query,
                    view_id: request.view_id,
                    actions: request.actions,
                    enabled: request.enabled,
                    display_order,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;

        if request.apply_to_existing {
            self.repository
                .enqueue_job(
                    &mut transaction,
                    NewJob {
                        kind: JobKind::Backfill,
                        payload: encode_payload(&BackfillJob::RetroApplyRule {
                            user_id,
                            rule_id: rule.id,
                        })?,
                        dedup_key: Some(format!("retro_apply:{}", rule.id)),
                        run_at: now,
                        max_attempts: self.max_job_attempts,
                    },
                )
                .await?;
        }
        commit(transaction).await?;

        query_cache::flush();
        Ok(rule)
    }

    #[tracing::instrument(level = "debug", skip(self, patch), fields(rule_id = rule_id.to_string()), err)]
    pub async fn update_rule(
        &self,
        rule_id: RuleId,
        patch: RulePatch,
        user_id: UserId,
    ) -> Result<Rule, ForgeInboxError> {
        if let Some(actions) = &patch.actions {
            validate_rule_actions(actions)?;
        }

        let mut transaction = self.repository.begin().await?;
        let existing = self
            .repository
            .get_rule(&mut transaction, rule_id, user_id)
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("Rule {rule_id} not found")))?;

        let query = patch
            .query
            .clone()
            .unwrap_or(existing.query)
            .filter(|query| !query.trim().is_empty());
        let view_id = patch.view_id.clone().unwrap_or(existing.view_id);
        validate_rule_definition(query.as_deref(), view_id.as_ref())?;
        if let Some(view_id) = &view_id {
            self.view_service
                .resolve_view(&mut transaction, view_id, user_id)
                .await?;
        }

        let rule = self
            .repository
            .update_rule(&mut transaction, rule_id, &patch, user_id)
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("Rule {rule_id} not found")))?;
        commit(transaction).await?;

        query_cache::flush();
        self.disabled_rules
            .lock()
            .expect("disabled rule set poisoned")
            .remove(&rule_id);
        Ok(rule)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(rule_id = rule_id.to_string()), err)]
    pub async fn delete_rule(&self, rule_id: RuleId, user_id: UserId) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let deleted = self
            .repository
            .delete_rule(&mut transaction, rule_id, user_id)
            .await?;
        if !deleted {
            return Err(ForgeInboxError::ItemNotFound(format!(
                "Rule {rule_id} not found"
            )));
        }
        commit(transaction).await?;
        query_cache::flush();
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(count = ordered_ids.len()), err)]
    pub async fn reorder_rules(
        &self,
        ordered_ids: &[RuleId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        for rule_id in ordered_ids {
            self.repository
                .get_rule(&mut transaction, *rule_id, user_id)
                .await?
                .ok_or_else(|| {
                    ForgeInboxError::ItemNotFound(format!("Rule {rule_id} not found"))
                })?;
        }
        self.repository
            .reorder_rules(&mut transaction, ordered_ids, user_id)
            .await?;
        commit(transaction).await
    }

    /// Applies one rule to one notification: evaluate the predicate in
    /// memory, then run the actions in their fixed order. Invoked by the
    /// `apply_rule` job handler after sync inserts a row.
    #[tracing::instrument(
        level = "debug",
        skip(self),
        fields(rule_id = rule_id.to_string(), notification_id = notification_id.to_string()),
        err
    )]
    pub async fn apply_rule_to_notification(
        &self,
        rule_id: RuleId,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let Some(rule) = self
            .repository
            .get_rule(&mut transaction, rule_id, user_id)
            .await?
        else {
            // The rule was deleted between enqueue and execution.
            return Ok(false);
        };
        if !rule.enabled || self.is_sidelined(rule.id) {
            return Ok(false);
        }
        let Some(with_repo) = self
            .repository
            .get_notification(&mut transaction, notification_id, user_id)
            .await?
        else {
            return Ok(false);
        };

        let Some(predicate) = self.compile_predicate(&mut transaction, &rule, user_id).await?
        else {
            return Ok(false);
        };
        let context = EvalContext {
            notification: &with_repo.notification,
            repo: &with_repo.repo,
            tags: &with_repo.tags,
            now: Utc::now(),
        };
        if !forge_inbox::query::eval::matches(&predicate, &context) {
            return Ok(false);
        }

        self.apply_actions(&mut transaction, &rule, &[notification_id], user_id)
            .await?;
        commit(transaction).await?;
        self.count_cache.invalidate_user(user_id);
        Ok(true)
    }

    /// Retro-apply handler body: collects the ids matching the rule's
    /// predicate page by page, then applies actions in bounded batches,
    /// tolerating individual batch failures.
    #[tracing::instrument(level = "debug", skip(self), fields(rule_id = rule_id.to_string()), err)]
    pub async fn retro_apply_rule(
        &self,
        rule_id: RuleId,
        user_id: UserId,
    ) -> Result<u64, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let rule = self
            .repository
            .get_rule(&mut transaction, rule_id, user_id)
            .await?
            .ok_or_else(|| ForgeInboxError::ItemNotFound(format!("Rule {rule_id} not found")))?;
        let Some(predicate) = self.compile_predicate(&mut transaction, &rule, user_id).await?
        else {
            return Ok(0);
        };

        let mut matching_ids: Vec<NotificationId> = Vec::new();
        let mut offset = 0i64;
        loop {
            let translated = translate(
                &predicate,
                Utc::now(),
                RETRO_APPLY_BATCH_SIZE as i64,
                offset,
            );
            let page = self
                .repository
                .list_notifications_from_query(&mut transaction, &translated, user_id)
                .await?;
            let fetched = page.rows.len();
            matching_ids.extend(
                page.rows
                    .iter()
                    .map(|with_repo: &NotificationWithRepo| with_repo.notification.id),
            );
            if fetched < RETRO_APPLY_BATCH_SIZE {
                break;
            }
            offset += RETRO_APPLY_BATCH_SIZE as i64;
        }
        commit(transaction).await?;

        let mut applied = 0u64;
        for batch in matching_ids.chunks(RETRO_APPLY_BATCH_SIZE) {
            let mut transaction = self.repository.begin().await?;
            match self
                .apply_actions(&mut transaction, &rule, batch, user_id)
                .await
            {
                Ok(()) => {
                    commit(transaction).await?;
                    applied += batch.len() as u64;
                }
                Err(err) => {
                    warn!(
                        "Failed to retro-apply rule {} to a batch of {} notifications: {err:?}",
                        rule.id,
                        batch.len()
                    );
                }
            }
        }

        self.count_cache.invalidate_user(user_id);
        Ok(applied)
    }

    /// Resolves and compiles the rule's predicate, applying the default
    /// overlay. A predicate that no longer compiles sidelines the rule for
    /// this process lifetime and reports it.
    async fn compile_predicate(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        rule: &Rule,
        user_id: UserId,
    ) -> Result<Option<Expr>, ForgeInboxError> {
        let query = match (&rule.query, &rule.view_id) {
            (Some(query), _) => query.clone(),
            (None, Some(view_id)) => {
                self.view_service
                    .resolve_view(transaction, view_id, user_id)
                    .await?
                    .query
            }
            (None, None) => {
                return Err(ForgeInboxError::InvalidInputData {
                    source: None,
                    user_error: format!("Rule {} has neither query nor view", rule.name),
                })
            }
        };

        match query_cache::compile(&query) {
            Ok(expr) => Ok(Some(with_overlay(Some((*expr).clone())))),
            Err(err) => {
                warn!(
                    "Disabling rule {} for this process: predicate `{query}` no longer compiles: {err}",
                    rule.name
                );
                self.disabled_rules
                    .lock()
                    .expect("disabled rule set poisoned")
                    .insert(rule.id);
                Ok(None)
            }
        }
    }

    /// Fixed action order: remove_tags, assign_tags, skip_inbox, mark_read,
    /// star, archive, mute. Unknown tag ids are logged and skipped.
    async fn apply_actions(
        &self,
        transaction: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        rule: &Rule,
        notification_ids: &[NotificationId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        for tag_id in &rule.actions.remove_tags {
            self.repository
                .apply_action_by_ids(
                    transaction,
                    notification_ids,
                    &NotificationAction::RemoveTag { tag_id: *tag_id },
                    user_id,
                )
                .await?;
        }
        for tag_id in &rule.actions.assign_tags {
            if self
                .repository
                .get_tag(transaction, *tag_id, user_id)
                .await?
                .is_none()
            {
                warn!("Rule {} assigns unknown tag {tag_id}, skipping", rule.name);
                continue;
            }
            self.repository
                .apply_action_by_ids(
                    transaction,
                    notification_ids,
                    &NotificationAction::AssignTag { tag_id: *tag_id },
                    user_id,
                )
                .await?;
        }

        let mut lifecycle_actions = Vec::new();
        if rule.actions.skip_inbox {
            lifecycle_actions.push(NotificationAction::Filter);
        }
        if rule.actions.mark_read {
            lifecycle_actions.push(NotificationAction::MarkRead);
        }
        if rule.actions.star {
            lifecycle_actions.push(NotificationAction::Star);
        }
        if rule.actions.archive {
            lifecycle_actions.push(NotificationAction::Archive);
        }
        if rule.actions.mute {
            lifecycle_actions.push(NotificationAction::Mute);
        }
        for action in &lifecycle_actions {
            self.repository
                .apply_action_by_ids(transaction, notification_ids, action, user_id)
                .await?;
        }
        Ok(())
    }

    fn is_sidelined(&self, rule_id: RuleId) -> bool {
        self.disabled_rules
            .lock()
            .expect("disabled rule set poisoned")
            .contains(&rule_id)
    }
}

fn validate_rule_definition(
    query: Option<&str>,
    view_id: Option<&ViewId>,
) -> Result<(), ForgeInboxError> {
    match (query, view_id) {
        (Some(_), Some(_)) => Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "A rule takes either a query or a view, not both".to_string(),
        }),
        (None, None) => Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "A rule requires a query or a view".to_string(),
        }),
        (Some(query), None) => {
            if query.trim().is_empty() {
                return Err(ForgeInboxError::InvalidInputData {
                    source: None,
                    user_error: "A rule query must not be empty".to_string(),
                });
            }
            parse(query)?;
            Ok(())
        }
        (None, Some(_)) => Ok(()),
    }
}

fn validate_rule_actions(actions: &RuleActions) -> Result<(), ForgeInboxError> {
    if actions.is_empty() {
        return Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "A rule requires at least one action".to_string(),
        });
    }
    let overlapping = actions.overlapping_tags();
    if !overlapping.is_empty() {
        return Err(ForgeInboxError::InvalidInputData {
            source: None,
            user_error: "assign_tags and remove_tags must be disjoint".to_string(),
        });
    }
    Ok(())
}
