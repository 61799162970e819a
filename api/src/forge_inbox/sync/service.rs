use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, info, warn};

use forge_inbox::{
    notification::{Subject, SubjectType},
    rule::Rule,
    upstream::{NotificationRecord, SubjectDetail},
    NotificationId, UserId,
};

use crate::{
    forge_inbox::{view::service::CountCache, ForgeInboxError, UpsertStatus},
    integrations::UpstreamClient,
    jobs::{encode_payload, ApplyRuleJob, JobKind},
    repository::{
        commit,
        job::{JobRepository, NewJob},
        notification::{NotificationDraft, NotificationRepository},
        repo::RepoRepository,
        rule::RuleRepository,
        sync_state::{SyncStatePatch, SyncStateRepository},
        user::UserRepository,
        Repository,
    },
};

/// Subject kinds worth a detail request; the rest are fully described by
/// the notification itself.
fn is_enrichable(kind: &SubjectType) -> bool {
    matches!(
        kind,
        SubjectType::PullRequest | SubjectType::Issue | SubjectType::Discussion
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOutcome {
    pub fetched: usize,
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

pub struct SyncService {
    repository: Arc<Repository>,
    upstream: Arc<dyn UpstreamClient>,
    count_cache: Arc<CountCache>,
    concurrency: usize,
    max_job_attempts: i64,
}

impl SyncService {
    pub fn new(
        repository: Arc<Repository>,
        upstream: Arc<dyn UpstreamClient>,
        count_cache: Arc<CountCache>,
        concurrency: usize,
        max_job_attempts: i64,
    ) -> SyncService {
        SyncService {
            repository,
            upstream,
            count_cache,
            concurrency,
            max_job_attempts,
        }
    }

    /// Steady-state incremental sync: everything upstream reports as
    /// updated since the stored cursor. Newly inserted rows fan out one
    /// `apply_rule` job per enabled rule; the cursor only advances after
    /// the batch commits.
    #[tracing::instrument(level = "info", skip(self), err)]
    pub async fn sync_notifications(&self, user_id: UserId) -> Result<SyncOutcome, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let sync_state = self
            .repository
            .get_or_create_sync_state(&mut transaction, user_id)
            .await?;
        let rules = self
            .repository
            .list_rules(&mut transaction, true, user_id)
            .await?;
        commit(transaction).await?;

        let stream = self
            .upstream
            .list_notifications_since(sync_state.latest_notification_at);
        let (outcome, cursors) = self.ingest_stream(stream, &rules, true, user_id).await?;

        if outcome.fetched > 0 && outcome.committed() == 0 {
            return Err(ForgeInboxError::Unexpected(anyhow::anyhow!(
                "Sync failed: none of the {} fetched notifications could be written",
                outcome.fetched
            )));
        }

        let now = Utc::now();
        let mut transaction = self.repository.begin().await?;
        self.repository
            .update_sync_state(
                &mut transaction,
                &SyncStatePatch {
                    last_successful_poll: Some(now),
                    latest_notification_at: cursors.max_updated_at,
                    initial_sync_completed_at: sync_state
                        .initial_sync_completed_at
                        .is_none()
                        .then_some(now),
                    oldest_notification_synced_at: None,
                },
                user_id,
            )
            .await?;
        commit(transaction).await?;

        self.apply_retention(user_id).await?;

        if outcome.committed() > 0 {
            self.count_cache.invalidate_user(user_id);
        }
        info!(
            "Synced {} notifications for user {user_id} ({} created, {} updated, {} failed)",
            outcome.fetched, outcome.created, outcome.updated, outcome.failed
        );
        Ok(outcome)
    }

    /// Prunes archived notifications past the configured retention window.
    /// Runs after every successful incremental sync; disabled when no
    /// retention is configured.
    async fn apply_retention(&self, user_id: UserId) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let user = self.repository.get_or_create_user(&mut transaction).await?;
        let Some(retention_days) = user.settings.retention_days else {
            return Ok(());
        };
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let pruned = self
            .repository
            .prune_notifications(&mut transaction, cutoff, user_id)
            .await?;
        commit(transaction).await?;
        if pruned > 0 {
            info!("Pruned {pruned} archived notifications older than {retention_days} days");
        }
        Ok(())
    }

    /// Historical backfill: notifications strictly older than `before`
    /// (default: the stored backfill cursor). Never fires rules.
    #[tracing::instrument(level = "info", skip(self), err)]
    pub async fn backfill(
        &self,
        before: Option<DateTime<Utc>>,
        max_count: Option<u32>,
        unread_only: bool,
        user_id: UserId,
    ) -> Result<SyncOutcome, ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let sync_state = self
            .repository
            .get_or_create_sync_state(&mut transaction, user_id)
            .await?;
        commit(transaction).await?;

        let before = before
            .or(sync_state.oldest_notification_synced_at)
            .unwrap_or_else(Utc::now);
        let stream = self
            .upstream
            .list_notifications_before(before, unread_only, max_count);
        let (outcome, cursors) = self.ingest_stream(stream, &[], false, user_id).await?;

        if outcome.fetched > 0 && outcome.committed() == 0 {
            return Err(ForgeInboxError::Unexpected(anyhow::anyhow!(
                "Backfill failed: none of the {} fetched notifications could be written",
                outcome.fetched
            )));
        }

        if let Some(oldest) = cursors.min_updated_at {
            // The backfill cursor only ever moves backwards.
            let oldest = match sync_state.oldest_notification_synced_at {
                Some(current) => current.min(oldest),
                None => oldest,
            };
            let mut transaction = self.repository.begin().await?;
            self.repository
                .update_sync_state(
                    &mut transaction,
                    &SyncStatePatch {
                        oldest_notification_synced_at: Some(oldest),
                        ..Default::default()
                    },
                    user_id,
                )
                .await?;
            commit(transaction).await?;
        }

        if outcome.committed() > 0 {
            self.count_cache.invalidate_user(user_id);
        }
        info!(
            "Backfilled {} notifications for user {user_id} ({} created, {} failed)",
            outcome.fetched, outcome.created, outcome.failed
        );
        Ok(outcome)
    }

    /// Re-fetches the subject detail for one notification and refreshes
    /// the stored subject fields.
    #[tracing::instrument(level = "debug", skip(self), fields(notification_id = notification_id.to_string()), err)]
    pub async fn refresh_subject(
        &self,
        notification_id: NotificationId,
        user_id: UserId,
    ) -> Result<(), ForgeInboxError> {
        let mut transaction = self.repository.begin().await?;
        let Some(with_repo) = self
            .repository
            .get_notification(&mut transaction, notification_id, user_id)
            .await?
        else {
            return Ok(());
        };
        commit(transaction).await?;

        let notification = with_repo.notification;
        let repo = with_repo.repo;
        let (Some(number), true) = (
            notification.subject.number,
            is_enrichable(&notification.subject.kind),
        ) else {
            return Ok(());
        };

        let detail = self
            .upstream
            .get_subject(
                &repo.owner_login,
                repo.name(),
                number,
                &notification.subject.kind,
            )
            .await?;

        let draft = NotificationDraft {
            upstream_id: notification.upstream_id.clone(),
            repo_id: notification.repo_id,
            subject: merge_subject(notification.subject.clone(), Some(detail.clone())),
            reason: notification.reason.clone(),
            author_login: detail.author_login.or(notification.author_login.clone()),
            unread: !notification.is_read,
            upstream_updated_at: notification.upstream_updated_at,
        };
        let mut transaction = self.repository.begin().await?;
        self.repository
            .create_or_update_notification(&mut transaction, draft, user_id)
            .await?;
        commit(transaction).await
    }

    /// Drains an upstream stream with a bounded worker pool. Per-record
    /// failures are logged and skipped; partial success is success.
    async fn ingest_stream(
        &self,
        stream: crate::integrations::NotificationRecordStream<'_>,
        rules: &[Rule],
        fire_rules: bool,
        user_id: UserId,
    ) -> Result<(SyncOutcome, BatchCursors), ForgeInboxError> {
        let results: Vec<Result<RecordOutcome, ForgeInboxError>> = stream
            .map(|record| async move {
                match record {
                    Ok(record) => self.ingest_record(record, rules, fire_rules, user_id).await,
                    Err(err) => Err(err),
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut outcome = SyncOutcome::default();
        let mut cursors = BatchCursors::default();
        let mut first_error: Option<ForgeInboxError> = None;
        for result in results {
            outcome.fetched += 1;
            match result {
                Ok(record_outcome) => {
                    match record_outcome.status {
                        RecordStatus::Created => outcome.created += 1,
                        RecordStatus::Updated => outcome.updated += 1,
                        RecordStatus::Untouched => {}
                    }
                    cursors.observe(record_outcome.updated_at);
                }
                Err(err) => {
                    outcome.failed += 1;
                    warn!("Failed to ingest a notification: {err:?}");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        // A stream that failed before yielding anything committable is a
        // real failure (rate limit, auth, outage) and must surface to the
        // scheduler for backoff.
        if outcome.fetched > 0 && outcome.committed() == 0 && outcome.failed == outcome.fetched {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        Ok((outcome, cursors))
    }

    async fn ingest_record(
        &self,
        record: NotificationRecord,
        rules: &[Rule],
        fire_rules: bool,
        user_id: UserId,
    ) -> Result<RecordOutcome, ForgeInboxError> {
        let detail = self.enrich(&record).await;

        let mut transaction = self.repository.begin().await?;
        let repo = self
            .repository
            .upsert_repo(&mut transaction, &record.repo, user_id)
            .await?;

        let subject = Subject {
            kind: record.subject.kind.clone(),
            title: record.subject.title.clone(),
            number: record.subject.number(),
            state: None,
            merged: None,
            state_reason: None,
            raw: None,
        };
        let author_login = detail.as_ref().and_then(|d| d.author_login.clone());
        let draft = NotificationDraft {
            upstream_id: record.upstream_id.clone(),
            repo_id: repo.id,
            subject: merge_subject(subject, detail),
            reason: record.reason.clone(),
            author_login,
            unread: record.unread,
            upstream_updated_at: record.updated_at,
        };

        let upserted = self
            .repository
            .create_or_update_notification(&mut transaction, draft, user_id)
            .await?;

        if fire_rules {
            if let UpsertStatus::Created(notification) = &upserted {
                for rule in rules {
                    let job = ApplyRuleJob {
                        user_id,
                        notification_id: notification.id,
                        rule_id: rule.id,
                    };
                    self.repository
                        .enqueue_job(
                            &mut transaction,
                            NewJob {
                                kind: JobKind::ApplyRule,
                                dedup_key: Some(job.dedup_key()),
                                payload: encode_payload(&job)?,
                                run_at: Utc::now(),
                                max_attempts: self.max_job_attempts,
                            },
                        )
                        .await?;
                }
            }
        }
        commit(transaction).await?;

        let status = match &upserted {
            UpsertStatus::Created(_) => RecordStatus::Created,
            UpsertStatus::Updated { .. } => RecordStatus::Updated,
            UpsertStatus::Untouched(_) => RecordStatus::Untouched,
        };
        if matches!(status, RecordStatus::Untouched) {
            debug!("Notification {} unchanged upstream", record.upstream_id);
        }

        Ok(RecordOutcome {
            status,
            updated_at: record.updated_at,
        })
    }

    /// Subject enrichment is best-effort: a failed detail fetch is logged
    /// and the row is written with whatever the notification itself
    /// carried.
    async fn enrich(&self, record: &NotificationRecord) -> Option<SubjectDetail> {
        if !is_enrichable(&record.subject.kind) {
            return None;
        }
        let number = record.subject.number()?;
        let (owner, repo_name) = record.repo.full_name.split_once('/')?;

        match self
            .upstream
            .get_subject(owner, repo_name, number, &record.subject.kind)
            .await
        {
            Ok(detail) => Some(detail),
            Err(err) => {
                warn!(
                    "Failed to fetch subject detail for {}#{number}: {err:?}",
                    record.repo.full_name
                );
                None
            }
        }
    }
}

impl SyncOutcome {
    pub fn committed(&self) -> usize {
        self.fetched - self.failed
    }
}

/// Min/max upstream-updated-at observed over the committed records of one
/// batch; drives both sync cursors.
#[derive(Debug, Clone, Copy, Default)]
struct BatchCursors {
    min_updated_at: Option<DateTime<Utc>>,
    max_updated_at: Option<DateTime<Utc>>,
}

impl BatchCursors {
    fn observe(&mut self, updated_at: DateTime<Utc>) {
        self.min_updated_at = Some(match self.min_updated_at {
            Some(current) => current.min(updated_at),
            None => updated_at,
        });
        self.max_updated_at = Some(match self.max_updated_at {
            Some(current) => current.max(updated_at),
            None => updated_at,
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum RecordStatus {
    Created,
    Updated,
    Untouched,
}

#[derive(Debug, Clone, Copy)]
struct RecordOutcome {
    status: RecordStatus,
    updated_at: DateTime<Utc>,
}

fn merge_subject(mut subject: Subject, detail: Option<SubjectDetail>) -> Subject {
    if let Some(detail) = detail {
        subject.state = detail.state.or(subject.state);
        subject.merged = detail.merged.or(subject.merged);
        subject.state_reason = detail.state_reason.or(subject.state_reason);
        subject.number = detail.number.or(subject.number);
        subject.raw = detail.raw.or(subject.raw);
    }
    subject
}
