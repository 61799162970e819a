use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{view::RESERVED_SLUGS, NotificationId, TagId, UserId};

/// User defined label. Names are unique per user; slugs are derived from the
/// name and must stay clear of the reserved system slugs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: TagId,
    pub user_id: UserId,
    pub name: String,
    pub slug: String,
    pub color: Option<String>,
    pub display_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `(tag, notification)` join row. A notification's tag set is derived from
/// these rows; there is no denormalised tag column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAssignment {
    pub tag_id: TagId,
    pub entity_type: String,
    pub entity_id: NotificationId,
}

pub const TAG_ENTITY_NOTIFICATION: &str = "notification";

/// Derives a URL-safe slug from a display name: lowercased, runs of
/// non-alphanumeric characters collapsed to a single dash.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn is_reserved_slug(slug: &str) -> bool {
    RESERVED_SLUGS.contains(&slug)
}
