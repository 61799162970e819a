use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, Transaction};

use forge_inbox::{
    rule::{Rule, RuleActions},
    RuleId, UserId, ViewId,
};

use crate::{
    forge_inbox::ForgeInboxError,
    repository::{classify_db_error, db_error, Repository},
};

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub query: Option<Option<String>>,
    pub view_id: Option<Option<ViewId>>,
    pub actions: Option<RuleActions>,
    pub enabled: Option<bool>,
}

#[async_trait]
pub trait RuleRepository {
    async fn list_rules(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        enabled_only: bool,
        user_id: UserId,
    ) -> Result<Vec<Rule>, ForgeInboxError>;

    async fn get_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        user_id: UserId,
    ) -> Result<Option<Rule>, ForgeInboxError>;

    async fn create_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule: Rule,
    ) -> Result<Rule, ForgeInboxError>;

    async fn update_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        patch: &RulePatch,
        user_id: UserId,
    ) -> Result<Option<Rule>, ForgeInboxError>;

    async fn delete_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError>;

    /// Rules linked to a view, counted before a view delete and cascaded
    /// over when the delete is forced.
    async fn list_rules_for_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<Vec<Rule>, ForgeInboxError>;

    async fn next_rule_display_order(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError>;

    async fn reorder_rules(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[RuleId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError>;
}

#[async_trait]
impl RuleRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(user.id = user_id.to_string()), err)]
    async fn list_rules(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        enabled_only: bool,
        user_id: UserId,
    ) -> Result<Vec<Rule>, ForgeInboxError> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT * FROM rule WHERE user_id = ");
        builder.push_bind(user_id.to_string());
        if enabled_only {
            builder.push(" AND enabled = 1");
        }
        builder.push(" ORDER BY display_order, name");

        let rows = builder
            .build_query_as::<RuleRow>()
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to list rules: {err}");
                db_error(err, message)
            })?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = rule_id.to_string()), err)]
    async fn get_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        user_id: UserId,
    ) -> Result<Option<Rule>, ForgeInboxError> {
        let row =
            sqlx::query_as::<_, RuleRow>("SELECT * FROM rule WHERE id = ? AND user_id = ?")
                .bind(rule_id.to_string())
                .bind(user_id.to_string())
                .fetch_optional(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to fetch rule {rule_id}: {err}");
                    db_error(err, message)
                })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = rule.name), err)]
    async fn create_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule: Rule,
    ) -> Result<Rule, ForgeInboxError> {
        let actions = serde_json::to_string(&rule.actions)
            .context("Failed to serialize rule actions")?;
        let row = sqlx::query_as::<_, RuleRow>(
            r#"
                INSERT INTO rule
                  (id, user_id, name, query, view_id, actions, enabled,
                   display_order, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING *
            "#,
        )
        .bind(rule.id.to_string())
        .bind(rule.user_id.to_string())
        .bind(&rule.name)
        .bind(&rule.query)
        .bind(rule.view_id.as_ref().map(|id| id.to_string()))
        .bind(actions)
        .bind(rule.enabled)
        .bind(rule.display_order)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .fetch_one(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to create rule {}: {err}", rule.name);
            classify_db_error(err, &rule.name, message)
        })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = rule_id.to_string()), err)]
    async fn update_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        patch: &RulePatch,
        user_id: UserId,
    ) -> Result<Option<Rule>, ForgeInboxError> {
        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE rule SET updated_at = ");
        builder.push_bind(Utc::now());
        if let Some(name) = &patch.name {
            builder.push(", name = ");
            builder.push_bind(name.clone());
        }
        if let Some(query) = &patch.query {
            builder.push(", query = ");
            builder.push_bind(query.clone());
        }
        if let Some(view_id) = &patch.view_id {
            builder.push(", view_id = ");
            builder.push_bind(view_id.as_ref().map(|id| id.to_string()));
        }
        if let Some(actions) = &patch.actions {
            let actions = serde_json::to_string(actions)
                .context("Failed to serialize rule actions")?;
            builder.push(", actions = ");
            builder.push_bind(actions);
        }
        if let Some(enabled) = patch.enabled {
            builder.push(", enabled = ");
            builder.push_bind(enabled);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(rule_id.to_string());
        builder.push(" AND user_id = ");
        builder.push_bind(user_id.to_string());
        builder.push(" RETURNING *");

        let row = builder
            .build_query_as::<RuleRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update rule {rule_id}: {err}");
                classify_db_error(err, patch.name.as_deref().unwrap_or("rule"), message)
            })?;

        row.map(|row| row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = rule_id.to_string()), err)]
    async fn delete_rule(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        rule_id: RuleId,
        user_id: UserId,
    ) -> Result<bool, ForgeInboxError> {
        let result = sqlx::query("DELETE FROM rule WHERE id = ? AND user_id = ?")
            .bind(rule_id.to_string())
            .bind(user_id.to_string())
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete rule {rule_id}: {err}");
                db_error(err, message)
            })?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = view_id.to_string()), err)]
    async fn list_rules_for_view(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        view_id: &ViewId,
        user_id: UserId,
    ) -> Result<Vec<Rule>, ForgeInboxError> {
        let rows = sqlx::query_as::<_, RuleRow>(
            "SELECT * FROM rule WHERE view_id = ? AND user_id = ? ORDER BY display_order",
        )
        .bind(view_id.to_string())
        .bind(user_id.to_string())
        .fetch_all(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to list rules for view {view_id}: {err}");
            db_error(err, message)
        })?;

        rows.into_iter().map(|row| row.try_into()).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn next_rule_display_order(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        user_id: UserId,
    ) -> Result<i64, ForgeInboxError> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT max(display_order) FROM rule WHERE user_id = ?")
                .bind(user_id.to_string())
                .fetch_one(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to compute next rule display order: {err}");
                    db_error(err, message)
                })?;
        Ok(max.unwrap_or(0) + 100)
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_rules(
        &self,
        executor: &mut Transaction<'_, Sqlite>,
        ordered_ids: &[RuleId],
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        for (position, rule_id) in ordered_ids.iter().enumerate() {
            sqlx::query("UPDATE rule SET display_order = ? WHERE id = ? AND user_id = ?")
                .bind((position as i64 + 1) * 100)
                .bind(rule_id.to_string())
                .bind(user_id.to_string())
                .execute(&mut **executor)
                .await
                .map_err(|err| {
                    let message = format!("Failed to reorder rule {rule_id}: {err}");
                    db_error(err, message)
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, FromRow)]
pub struct RuleRow {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub query: Option<String>,
    pub view_id: Option<String>,
    pub actions: String,
    pub enabled: bool,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = ForgeInboxError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        Ok(Rule {
            id: row
                .id
                .parse::<uuid::Uuid>()
                .map(RuleId::from)
                .context("Invalid rule id in storage")?,
            user_id: row
                .user_id
                .parse::<uuid::Uuid>()
                .map(UserId::from)
                .context("Invalid user id in storage")?,
            name: row.name,
            query: row.query,
            view_id: row.view_id.map(ViewId::from),
            actions: serde_json::from_str(&row.actions)
                .context("Invalid rule actions in storage")?,
            enabled: row.enabled,
            display_order: row.display_order,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
