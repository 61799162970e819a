use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::{
    forge_inbox::{
        rule::service::RuleService, sync::service::SyncService, ForgeInboxError,
    },
    jobs::{
        decode_payload, ApplyRuleJob, BackfillJob, Job, PollJob, SubjectRefreshJob,
        UpdateCheckJob,
    },
    scheduler::JobHandler,
};

pub struct PollHandler {
    pub sync_service: Arc<SyncService>,
}

#[async_trait]
impl JobHandler for PollHandler {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError> {
        let payload: PollJob = decode_payload(&job.payload)?;
        match self.sync_service.sync_notifications(payload.user_id).await {
            // Nothing to poll until a token is configured; the next
            // trigger will try again.
            Err(ForgeInboxError::NoTokenConfigured) => Ok(()),
            Err(err) => Err(err),
            Ok(_) => Ok(()),
        }
    }
}

pub struct ApplyRuleHandler {
    pub rule_service: Arc<RuleService>,
}

#[async_trait]
impl JobHandler for ApplyRuleHandler {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError> {
        let payload: ApplyRuleJob = decode_payload(&job.payload)?;
        self.rule_service
            .apply_rule_to_notification(
                payload.rule_id,
                payload.notification_id,
                payload.user_id,
            )
            .await?;
        Ok(())
    }
}

pub struct BackfillHandler {
    pub sync_service: Arc<SyncService>,
    pub rule_service: Arc<RuleService>,
}

#[async_trait]
impl JobHandler for BackfillHandler {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError> {
        match decode_payload(&job.payload)? {
            BackfillJob::History {
                user_id,
                before,
                max_count,
                unread_only,
            } => {
                self.sync_service
                    .backfill(before, max_count, unread_only, user_id)
                    .await?;
            }
            BackfillJob::RetroApplyRule { user_id, rule_id } => {
                self.rule_service.retro_apply_rule(rule_id, user_id).await?;
            }
        }
        Ok(())
    }
}

pub struct SubjectRefreshHandler {
    pub sync_service: Arc<SyncService>,
}

#[async_trait]
impl JobHandler for SubjectRefreshHandler {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError> {
        let payload: SubjectRefreshJob = decode_payload(&job.payload)?;
        self.sync_service
            .refresh_subject(payload.notification_id, payload.user_id)
            .await
    }
}

/// Update checking is delegated to the packaging layer; the job records
/// that the check ran so the periodic trigger stays accurate.
pub struct UpdateCheckHandler;

#[async_trait]
impl JobHandler for UpdateCheckHandler {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError> {
        let payload: UpdateCheckJob = decode_payload(&job.payload)?;
        debug!(
            "Update check requested for user {}; delegated to the updater",
            payload.user_id
        );
        Ok(())
    }
}
