use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{repo::Repo, NotificationId, RepoId, TagId, UserId};

/// The unit of triage: one upstream notification mirrored into the local
/// store, together with its lifecycle flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    /// Upstream notification (thread) identifier, unique per user.
    pub upstream_id: String,
    pub repo_id: RepoId,
    pub subject: Subject,
    pub reason: String,
    pub author_login: Option<String>,
    pub is_read: bool,
    pub archived: bool,
    pub muted: bool,
    pub starred: bool,
    /// Set by rule `skip_inbox` actions only, never by direct user action.
    pub filtered: bool,
    pub snoozed_until: Option<DateTime<Utc>>,
    /// Most relevant known activity date: the upstream update date, unless a
    /// snooze overrode it with `snoozed_until`.
    pub effective_sort_date: DateTime<Utc>,
    pub upstream_updated_at: DateTime<Utc>,
    pub imported_at: DateTime<Utc>,
}

impl Notification {
    /// A snooze only counts while its deadline is in the future; an elapsed
    /// `snoozed_until` re-enters the inbox without any cleanup job.
    pub fn is_snoozed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.snoozed_until, Some(until) if until > now)
    }

    pub fn in_inbox(&self, now: DateTime<Utc>) -> bool {
        !self.archived && !self.muted && !self.filtered && !self.is_snoozed(now)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.archived && !self.is_snoozed(now)
    }
}

/// The thing a notification is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectType,
    pub title: String,
    pub number: Option<i64>,
    pub state: Option<String>,
    pub merged: Option<bool>,
    pub state_reason: Option<String>,
    /// Raw subject payload as returned by the upstream provider, kept for
    /// later re-enrichment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectType {
    PullRequest,
    Issue,
    Release,
    Discussion,
    Commit,
    CheckSuite,
    Other(String),
}

impl SubjectType {
    pub fn from_kind(kind: &str) -> SubjectType {
        match kind {
            "PullRequest" => SubjectType::PullRequest,
            "Issue" => SubjectType::Issue,
            "Release" => SubjectType::Release,
            "Discussion" => SubjectType::Discussion,
            "Commit" => SubjectType::Commit,
            "CheckSuite" => SubjectType::CheckSuite,
            other => SubjectType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SubjectType::PullRequest => "PullRequest",
            SubjectType::Issue => "Issue",
            SubjectType::Release => "Release",
            SubjectType::Discussion => "Discussion",
            SubjectType::Commit => "Commit",
            SubjectType::CheckSuite => "CheckSuite",
            SubjectType::Other(kind) => kind,
        }
    }
}

impl std::fmt::Display for SubjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubjectType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(SubjectType::from_kind(s))
    }
}

/// A notification joined with its repository and assigned tags, as listed by
/// queries and consumed by the in-memory evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationWithRepo {
    pub notification: Notification,
    pub repo: Repo,
    #[serde(default)]
    pub tags: Vec<crate::tag::Tag>,
}

/// A single lifecycle mutation, applied either directly by the user or by a
/// matching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NotificationAction {
    MarkRead,
    MarkUnread,
    Archive,
    Unarchive,
    Mute,
    Unmute,
    Star,
    Unstar,
    Snooze { until: DateTime<Utc> },
    Unsnooze,
    Filter,
    Unfilter,
    AssignTag { tag_id: TagId },
    RemoveTag { tag_id: TagId },
}

impl NotificationAction {
    /// Applies the action to an in-memory notification. Tag actions are a
    /// no-op here; tag assignments live in their own table and are handled
    /// by the store.
    pub fn apply_in_memory(&self, notification: &mut Notification) {
        match self {
            NotificationAction::MarkRead => notification.is_read = true,
            NotificationAction::MarkUnread => notification.is_read = false,
            NotificationAction::Archive => notification.archived = true,
            NotificationAction::Unarchive => notification.archived = false,
            NotificationAction::Mute => notification.muted = true,
            NotificationAction::Unmute => notification.muted = false,
            NotificationAction::Star => notification.starred = true,
            NotificationAction::Unstar => notification.starred = false,
            NotificationAction::Snooze { until } => {
                notification.snoozed_until = Some(*until);
                notification.effective_sort_date = *until;
            }
            NotificationAction::Unsnooze => {
                notification.snoozed_until = None;
                notification.effective_sort_date = notification.upstream_updated_at;
            }
            NotificationAction::Filter => notification.filtered = true,
            NotificationAction::Unfilter => notification.filtered = false,
            NotificationAction::AssignTag { .. } | NotificationAction::RemoveTag { .. } => {}
        }
    }
}
