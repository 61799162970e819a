use std::collections::BTreeSet;

use chrono::{Duration, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rstest::*;

use forge_inbox::{
    notification::{NotificationAction, NotificationWithRepo},
    query::{
        eval::{matches, EvalContext},
        overlay::with_overlay,
        parse, parse_optional,
    },
    NotificationId,
};

use forge_inbox_api::repository::{
    notification::NotificationRepository,
    search::translate,
};

use crate::helpers::{seed_notification, tested_app, TestedApp};

/// Builds a corpus of notifications spread over repositories, authors and
/// every lifecycle flag combination the query language can observe.
async fn seed_corpus(app: &TestedApp) -> Vec<NotificationId> {
    let repos = ["acme/widgets", "acme/gadgets", "evilcorp/tools"];
    let authors = [Some("octocat"), Some("dependabot[bot]"), None];
    let mut ids = Vec::new();

    for i in 0..12 {
        let repo = repos[i % repos.len()];
        let author = authors[i % authors.len()];
        let notification = seed_notification(
            app,
            &format!("corpus-{i}"),
            repo,
            &format!("Notification number {i} about builds"),
            author,
        )
        .await;
        ids.push(notification.id);
    }

    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    let now = Utc::now();
    for (i, id) in ids.iter().enumerate() {
        let mut actions: Vec<NotificationAction> = Vec::new();
        if i % 2 == 0 {
            actions.push(NotificationAction::MarkRead);
        }
        if i % 3 == 0 {
            actions.push(NotificationAction::Archive);
        }
        if i % 4 == 0 {
            actions.push(NotificationAction::Mute);
        }
        if i % 5 == 0 {
            actions.push(NotificationAction::Star);
        }
        if i == 7 {
            actions.push(NotificationAction::Filter);
        }
        if i == 8 {
            actions.push(NotificationAction::Snooze {
                until: now + Duration::hours(6),
            });
        }
        if i == 9 {
            actions.push(NotificationAction::Snooze {
                until: now - Duration::hours(6),
            });
        }
        for action in &actions {
            repository
                .apply_action(&mut transaction, *id, action, app.user_id)
                .await
                .expect("action failed");
        }
    }
    transaction.commit().await.expect("commit failed");
    ids
}

async fn all_rows(app: &TestedApp) -> Vec<NotificationWithRepo> {
    let expr = parse("in:anywhere").unwrap();
    let translated = translate(&expr, Utc::now(), 1000, 0);
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    repository
        .list_notifications_from_query(&mut transaction, &translated, app.user_id)
        .await
        .expect("list failed")
        .rows
}

async fn ids_from_store(app: &TestedApp, query: &str) -> BTreeSet<i64> {
    let now = Utc::now();
    let expr = with_overlay(parse_optional(query).expect("query must parse"));
    let translated = translate(&expr, now, 1000, 0);
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    repository
        .list_notifications_from_query(&mut transaction, &translated, app.user_id)
        .await
        .expect("list failed")
        .rows
        .into_iter()
        .map(|row| row.notification.id.0)
        .collect()
}

fn ids_from_evaluator(rows: &[NotificationWithRepo], query: &str) -> BTreeSet<i64> {
    let now = Utc::now();
    let expr = with_overlay(parse_optional(query).expect("query must parse"));
    rows.iter()
        .filter(|row| {
            matches(
                &expr,
                &EvalContext {
                    notification: &row.notification,
                    repo: &row.repo,
                    tags: &row.tags,
                    now,
                },
            )
        })
        .map(|row| row.notification.id.0)
        .collect()
}

const EQUIVALENCE_QUERIES: [&str; 24] = [
    "",
    "in:anywhere",
    "in:inbox",
    "in:archive",
    "in:snoozed",
    "in:filtered",
    "is:unread",
    "is:read",
    "is:starred",
    "is:muted",
    "is:unmuted",
    "is:snoozed",
    "is:unsnoozed",
    "is:active",
    "is:archived is:unread",
    "repo:acme",
    "repo:acme/widgets org:acme",
    "-repo:evilcorp",
    "author:octocat",
    "-author:dependabot",
    "reason:subscribed,mention",
    "type:pullrequest state:open",
    "builds",
    "(is:unread OR is:starred) -in:archive",
];

#[rstest]
#[tokio::test]
async fn test_translator_and_evaluator_agree_on_fixed_queries(
    #[future] tested_app: TestedApp,
) {
    let app = tested_app.await;
    seed_corpus(&app).await;
    let rows = all_rows(&app).await;
    assert_eq!(rows.len(), 12);

    for query in EQUIVALENCE_QUERIES {
        let from_store = ids_from_store(&app, query).await;
        let from_eval = ids_from_evaluator(&rows, query);
        assert_eq!(
            from_store, from_eval,
            "translator and evaluator disagree on `{query}`"
        );
    }
}

/// Randomised equivalence sweep with a fixed seed: the same corpus, a few
/// hundred generated queries.
#[rstest]
#[tokio::test]
async fn test_translator_and_evaluator_agree_on_random_queries(
    #[future] tested_app: TestedApp,
) {
    let app = tested_app.await;
    seed_corpus(&app).await;
    let rows = all_rows(&app).await;

    let mut rng = StdRng::seed_from_u64(0x4f52_4745);
    for _ in 0..200 {
        let query = random_query(&mut rng);
        let from_store = ids_from_store(&app, &query).await;
        let from_eval = ids_from_evaluator(&rows, &query);
        assert_eq!(
            from_store, from_eval,
            "translator and evaluator disagree on generated query `{query}`"
        );
    }
}

#[rstest]
#[tokio::test]
async fn test_unread_count_matches_filtered_list(#[future] tested_app: TestedApp) {
    let app = tested_app.await;
    seed_corpus(&app).await;
    let rows = all_rows(&app).await;

    for query in ["", "in:anywhere", "repo:acme", "is:starred"] {
        let unread_query = if query.is_empty() {
            "is:unread".to_string()
        } else {
            format!("{query} is:unread")
        };
        let count = ids_from_store(&app, &unread_query).await.len();
        let expected = ids_from_evaluator(&rows, &unread_query).len();
        assert_eq!(count, expected, "unread count mismatch for `{query}`");
    }
}

#[rstest]
fn test_parsing_is_idempotent_on_generated_queries() {
    let mut rng = StdRng::seed_from_u64(0x494e_424f);
    for _ in 0..100 {
        let query = random_query(&mut rng);
        let first = parse(&query).expect("generated query must parse");
        let second = parse(&query).expect("generated query must parse");
        assert_eq!(first, second, "parsing `{query}` is not idempotent");
    }
}

fn random_query(rng: &mut StdRng) -> String {
    let term_count = rng.random_range(1..=4);
    let mut terms = Vec::with_capacity(term_count);
    for _ in 0..term_count {
        terms.push(random_term(rng));
    }
    match rng.random_range(0..3) {
        0 => terms.join(" "),
        1 => terms.join(" OR "),
        _ => {
            if terms.len() >= 2 {
                let (head, tail) = terms.split_at(2);
                let mut query = format!("({})", head.join(" OR "));
                for term in tail {
                    query.push(' ');
                    query.push_str(term);
                }
                query
            } else {
                terms.join(" ")
            }
        }
    }
}

fn random_term(rng: &mut StdRng) -> String {
    let negate = rng.random_bool(0.25);
    let term = match rng.random_range(0..10) {
        0 => format!("is:{}", pick(rng, &["read", "unread", "archived", "inbox", "muted", "starred", "snoozed", "active", "filtered"])),
        1 => format!("in:{}", pick(rng, &["inbox", "archive", "snoozed", "filtered", "anywhere"])),
        2 => format!("repo:{}", pick(rng, &["acme", "widgets", "evilcorp/tools", "missing/repo"])),
        3 => format!("org:{}", pick(rng, &["acme", "evilcorp", "nobody"])),
        4 => format!("author:{}", pick(rng, &["octocat", "dependabot", "ghost"])),
        5 => format!("reason:{}", pick(rng, &["subscribed", "mention"])),
        6 => format!("state:{}", pick(rng, &["open", "closed"])),
        7 => format!("merged:{}", pick(rng, &["true", "false"])),
        8 => format!("archived:{}", pick(rng, &["yes", "no"])),
        _ => pick(rng, &["builds", "number", "nothing-matches"]).to_string(),
    };
    if negate {
        format!("-{term}")
    } else {
        term
    }
}

fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
    values[rng.random_range(0..values.len())]
}
