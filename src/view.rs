use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{UserId, ViewId};

/// A saved query. User views live in the store; the five lifecycle views are
/// defined statically and precede every user view in display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    pub id: ViewId,
    pub user_id: UserId,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub query: String,
    pub display_order: i64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A view together with its live unread count, as returned by `ListViews`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewWithCount {
    pub id: ViewId,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub query: String,
    pub display_order: i64,
    pub is_default: bool,
    pub builtin: bool,
    pub unread_count: i64,
}

/// Slugs no user view or tag may claim.
pub const RESERVED_SLUGS: [&str; 7] = [
    "inbox",
    "everything",
    "done",
    "archive",
    "snoozed",
    "starred",
    "search_results",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltinView {
    pub id: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
    pub query: &'static str,
    pub display_order: i64,
}

/// The five lifecycle views. Their identifiers are stable well-known
/// strings and their display orders precede the user view range, which
/// starts at 100.
pub const BUILTIN_VIEWS: [BuiltinView; 5] = [
    BuiltinView {
        id: "inbox",
        name: "Inbox",
        icon: "inbox",
        query: "in:inbox",
        display_order: 1,
    },
    BuiltinView {
        id: "everything",
        name: "Everything",
        icon: "stack",
        query: "in:anywhere",
        display_order: 2,
    },
    BuiltinView {
        id: "archive",
        name: "Archive",
        icon: "archive",
        query: "in:archive",
        display_order: 3,
    },
    BuiltinView {
        id: "snoozed",
        name: "Snoozed",
        icon: "clock",
        query: "in:snoozed",
        display_order: 4,
    },
    BuiltinView {
        id: "starred",
        name: "Starred",
        icon: "star",
        query: "is:starred",
        display_order: 5,
    },
];

pub fn builtin_view(id: &str) -> Option<&'static BuiltinView> {
    BUILTIN_VIEWS.iter().find(|view| view.id == id)
}

/// User views are spaced out in increments of 100 so a single view can be
/// moved between neighbours without rewriting every row.
pub const VIEW_DISPLAY_ORDER_STEP: i64 = 100;
