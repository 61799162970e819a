use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RuleId, TagId, UserId, ViewId};

/// A predicate plus a set of actions applied automatically on ingest.
///
/// The predicate is either an inline query string or a reference to a view
/// whose query is resolved at evaluation time; exactly one of the two is
/// set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub user_id: UserId,
    pub name: String,
    pub query: Option<String>,
    pub view_id: Option<ViewId>,
    pub actions: RuleActions,
    pub enabled: bool,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Structured rule actions. Within one rule the application order is fixed:
/// remove_tags, assign_tags, skip_inbox, mark_read, star, archive, mute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub skip_inbox: bool,
    #[serde(default)]
    pub mark_read: bool,
    #[serde(default)]
    pub star: bool,
    #[serde(default)]
    pub archive: bool,
    #[serde(default)]
    pub mute: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assign_tags: Vec<TagId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_tags: Vec<TagId>,
}

impl RuleActions {
    pub fn is_empty(&self) -> bool {
        !self.skip_inbox
            && !self.mark_read
            && !self.star
            && !self.archive
            && !self.mute
            && self.assign_tags.is_empty()
            && self.remove_tags.is_empty()
    }

    /// `assign_tags` and `remove_tags` must be disjoint.
    pub fn overlapping_tags(&self) -> Vec<TagId> {
        self.assign_tags
            .iter()
            .filter(|tag_id| self.remove_tags.contains(tag_id))
            .copied()
            .collect()
    }
}
