use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::notification::SubjectType;

/// One notification as delivered by the upstream provider, before it is
/// enriched and written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub upstream_id: String,
    pub reason: String,
    pub unread: bool,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub repo: RepoRecord,
    pub subject: SubjectRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub upstream_id: String,
    pub full_name: String,
    pub owner_login: String,
    pub private: bool,
    pub default_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub title: String,
    pub kind: SubjectType,
    /// API URL of the subject resource; the trailing path segment carries
    /// the subject number for pull requests and issues.
    pub url: Option<Url>,
}

impl SubjectRecord {
    pub fn number(&self) -> Option<i64> {
        self.url
            .as_ref()?
            .path_segments()?
            .next_back()?
            .parse()
            .ok()
    }
}

/// Subject detail fetched from the upstream provider to enrich a
/// notification row: state, merged flag, author.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubjectDetail {
    pub state: Option<String>,
    pub merged: Option<bool>,
    pub state_reason: Option<String>,
    pub author_login: Option<String>,
    pub number: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// One page of subject timeline events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub events: Vec<TimelineEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event: String,
    pub actor_login: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub body: Option<String>,
}
