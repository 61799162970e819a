use chrono::{DateTime, Utc};

use super::{
    ast::{BinaryOp, Expr, Term},
    validate::parse_bool,
    Field,
};
use crate::{notification::Notification, repo::Repo, tag::Tag};

/// Everything the in-memory evaluator needs to answer a query for one
/// notification. `now` is injected so snooze semantics are deterministic
/// under test and identical to the translator's bound timestamp.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub notification: &'a Notification,
    pub repo: &'a Repo,
    pub tags: &'a [Tag],
    pub now: DateTime<Utc>,
}

/// Walks the AST against a single notification. Must stay semantically
/// identical to the store translator under the same overlay.
pub fn matches(expr: &Expr, ctx: &EvalContext<'_>) -> bool {
    match expr {
        Expr::Term(term) => eval_term(term, ctx),
        Expr::FreeText(text) => {
            contains(&ctx.notification.subject.title, text)
                || contains(&ctx.repo.full_name, text)
        }
        Expr::Binary { op, left, right } => match op {
            BinaryOp::And => matches(left, ctx) && matches(right, ctx),
            BinaryOp::Or => matches(left, ctx) || matches(right, ctx),
        },
        Expr::Not(inner) => !matches(inner, ctx),
        Expr::Paren(inner) => matches(inner, ctx),
    }
}

fn eval_term(term: &Term, ctx: &EvalContext<'_>) -> bool {
    let hit = term
        .values
        .iter()
        .any(|value| eval_value(term.field, value, ctx));
    hit != term.negated
}

fn eval_value(field: Field, value: &str, ctx: &EvalContext<'_>) -> bool {
    let n = ctx.notification;
    match field {
        Field::Is => match value {
            "read" => n.is_read,
            "unread" => !n.is_read,
            "archived" => n.archived,
            "inbox" => n.in_inbox(ctx.now),
            "muted" => n.muted,
            "unmuted" => !n.muted,
            "starred" => n.starred,
            "unstarred" => !n.starred,
            "snoozed" => n.is_snoozed(ctx.now),
            "unsnoozed" => !n.is_snoozed(ctx.now),
            "active" => n.is_active(ctx.now),
            "filtered" => n.filtered,
            _ => false,
        },
        Field::In => match value {
            "inbox" => n.in_inbox(ctx.now),
            "archive" => n.archived,
            "snoozed" => n.is_snoozed(ctx.now),
            "filtered" => n.filtered && !n.archived,
            "anywhere" => true,
            _ => false,
        },
        Field::Repo => contains(&ctx.repo.full_name, value),
        Field::Org => contains(&ctx.repo.owner_login, value),
        Field::Reason => contains(&n.reason, value),
        Field::Type => contains(n.subject.kind.as_str(), value),
        Field::Author => n
            .author_login
            .as_deref()
            .is_some_and(|author| contains(author, value)),
        Field::State => n.subject.state.as_deref() == Some(value),
        Field::StateReason => n.subject.state_reason.as_deref() == Some(value),
        Field::Merged => match (parse_bool(value), n.subject.merged) {
            (Some(wanted), Some(merged)) => wanted == merged,
            _ => false,
        },
        Field::Read => parse_bool(value).is_some_and(|b| n.is_read == b),
        Field::Archived => parse_bool(value).is_some_and(|b| n.archived == b),
        Field::Muted => parse_bool(value).is_some_and(|b| n.muted == b),
        Field::Snoozed => parse_bool(value).is_some_and(|b| n.is_snoozed(ctx.now) == b),
        Field::Filtered => parse_bool(value).is_some_and(|b| n.filtered == b),
        Field::Tags => ctx
            .tags
            .iter()
            .any(|tag| contains(&tag.name, value) || contains(&tag.slug, value)),
    }
}

/// ASCII-case-insensitive substring match, mirroring the translator's
/// `LIKE` patterns.
fn contains(haystack: &str, needle: &str) -> bool {
    haystack
        .to_ascii_lowercase()
        .contains(&needle.to_ascii_lowercase())
}
