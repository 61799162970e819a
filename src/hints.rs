use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    notification::{Notification, NotificationAction},
    query::{
        eval::{matches, EvalContext},
        Expr,
    },
    repo::Repo,
    tag::Tag,
};

/// Candidate actions probed for dismissal. Read/star transitions are
/// defined never to dismiss a notification from a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintAction {
    Archive,
    Unarchive,
    Mute,
    Unmute,
    Snooze,
    Unsnooze,
    Filter,
    Unfilter,
}

pub const HINT_ACTIONS: [HintAction; 8] = [
    HintAction::Archive,
    HintAction::Unarchive,
    HintAction::Mute,
    HintAction::Unmute,
    HintAction::Snooze,
    HintAction::Unsnooze,
    HintAction::Filter,
    HintAction::Unfilter,
];

impl HintAction {
    /// A concrete action standing in for the hint. Snooze needs a deadline;
    /// any future timestamp predicts the same dismissal, so one day out is
    /// used as the probe.
    fn probe_action(&self, now: DateTime<Utc>) -> NotificationAction {
        match self {
            HintAction::Archive => NotificationAction::Archive,
            HintAction::Unarchive => NotificationAction::Unarchive,
            HintAction::Mute => NotificationAction::Mute,
            HintAction::Unmute => NotificationAction::Unmute,
            HintAction::Snooze => NotificationAction::Snooze {
                until: now + Duration::days(1),
            },
            HintAction::Unsnooze => NotificationAction::Unsnooze,
            HintAction::Filter => NotificationAction::Filter,
            HintAction::Unfilter => NotificationAction::Unfilter,
        }
    }
}

/// Returns the actions that would make `notification` stop matching the
/// given (already overlaid) view query. Pure and in-process: each candidate
/// is applied to a clone and re-evaluated.
pub fn dismissing_actions(
    view_query: &Expr,
    notification: &Notification,
    repo: &Repo,
    tags: &[Tag],
    now: DateTime<Utc>,
) -> Vec<HintAction> {
    let currently_matches = matches(
        view_query,
        &EvalContext {
            notification,
            repo,
            tags,
            now,
        },
    );
    if !currently_matches {
        return vec![];
    }

    HINT_ACTIONS
        .iter()
        .filter(|hint| {
            let mut probe = notification.clone();
            hint.probe_action(now).apply_in_memory(&mut probe);
            !matches(
                view_query,
                &EvalContext {
                    notification: &probe,
                    repo,
                    tags,
                    now,
                },
            )
        })
        .copied()
        .collect()
}
