use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use enum_display::EnumDisplay;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use forge_inbox::{JobId, NotificationId, RuleId, UserId};

use crate::forge_inbox::ForgeInboxError;

pub mod handlers;

/// Durable work item. Owned by the scheduler; every transition goes through
/// the job repository.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: Vec<u8>,
    /// Jobs sharing a dedup key are collapsed while one is still pending or
    /// running.
    pub dedup_key: Option<String>,
    pub run_at: DateTime<Utc>,
    pub attempts: i64,
    pub max_attempts: i64,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub lease_token: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumDisplay, Serialize, Deserialize)]
#[enum_display(case = "Snake")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Poll,
    ApplyRule,
    Backfill,
    SubjectRefresh,
    UpdateCheck,
}

impl JobKind {
    pub fn from_kind(kind: &str) -> Option<JobKind> {
        Some(match kind {
            "poll" => JobKind::Poll,
            "apply_rule" => JobKind::ApplyRule,
            "backfill" => JobKind::Backfill,
            "subject_refresh" => JobKind::SubjectRefresh,
            "update_check" => JobKind::UpdateCheck,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumDisplay, Serialize, Deserialize)]
#[enum_display(case = "Snake")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Dead,
}

impl JobStatus {
    pub fn from_status(status: &str) -> Option<JobStatus> {
        Some(match status {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "succeeded" => JobStatus::Succeeded,
            "failed" => JobStatus::Failed,
            "dead" => JobStatus::Dead,
            _ => return None,
        })
    }
}

pub const PAYLOAD_VERSION: u32 = 1;

/// Schema-versioned payload envelope. A handler rejects payloads from an
/// unknown schema version instead of misreading their fields.
#[derive(Debug, Serialize, Deserialize)]
struct JobEnvelope<T> {
    v: u32,
    body: T,
}

pub fn encode_payload<T: Serialize>(body: &T) -> Result<Vec<u8>, ForgeInboxError> {
    let envelope = JobEnvelope {
        v: PAYLOAD_VERSION,
        body,
    };
    Ok(serde_json::to_vec(&envelope).context("Failed to encode job payload")?)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ForgeInboxError> {
    let envelope: JobEnvelope<T> =
        serde_json::from_slice(payload).context("Failed to decode job payload")?;
    if envelope.v != PAYLOAD_VERSION {
        return Err(ForgeInboxError::Unexpected(anyhow!(
            "Unsupported job payload version {}",
            envelope.v
        )));
    }
    Ok(envelope.body)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PollJob {
    pub user_id: UserId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyRuleJob {
    pub user_id: UserId,
    pub notification_id: NotificationId,
    pub rule_id: RuleId,
}

impl ApplyRuleJob {
    /// Rule jobs for the same notification are serialised by their dedup
    /// key: while one is queued, re-enqueueing is a no-op.
    pub fn dedup_key(&self) -> String {
        format!("apply_rule:{}:{}", self.notification_id, self.rule_id)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BackfillJob {
    /// Historical ingestion, strictly older than `before`. Never fires
    /// rules.
    History {
        user_id: UserId,
        before: Option<DateTime<Utc>>,
        max_count: Option<u32>,
        unread_only: bool,
    },
    /// Retro-apply a rule to the existing records matching its predicate.
    RetroApplyRule { user_id: UserId, rule_id: RuleId },
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubjectRefreshJob {
    pub user_id: UserId,
    pub notification_id: NotificationId,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateCheckJob {
    pub user_id: UserId,
}
