use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rstest::*;

use forge_inbox::{rule::RuleActions, upstream::SubjectDetail};
use forge_inbox_api::{
    forge_inbox::{rule::service::CreateRuleRequest, ForgeInboxError},
    repository::sync_state::SyncStateRepository,
};

use crate::helpers::{
    base_time, drain_jobs, notification_by_upstream_id, tags_of, tested_app, upstream_record,
    TestedApp,
};

async fn sync_state(app: &TestedApp) -> forge_inbox::sync_state::SyncState {
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.unwrap();
    let state = repository
        .get_or_create_sync_state(&mut transaction, app.user_id)
        .await
        .unwrap();
    transaction.commit().await.unwrap();
    state
}

mod incremental {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Scenario: two upstream notifications, one matching an archive+tag
    /// rule. After the sync and the rule jobs drain, only the matching one
    /// is archived and tagged, and the inbox holds the other.
    #[rstest]
    #[tokio::test]
    async fn test_sync_ingests_and_rules_fire(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let tag = app
            .services
            .tag_service
            .create_tag(
                forge_inbox_api::forge_inbox::tag::service::CreateTagRequest {
                    name: "deps".to_string(),
                    color: None,
                },
                app.user_id,
            )
            .await
            .unwrap();
        app.services
            .rule_service
            .create_rule(
                CreateRuleRequest {
                    name: "dependabot".to_string(),
                    query: Some("author:dependabot".to_string()),
                    view_id: None,
                    actions: RuleActions {
                        archive: true,
                        assign_tags: vec![tag.id],
                        ..Default::default()
                    },
                    enabled: true,
                    apply_to_existing: false,
                },
                app.user_id,
            )
            .await
            .unwrap();

        app.upstream.push_since(upstream_record(
            "A",
            "acme/widgets",
            "Bump serde from 1.0 to 1.1",
            base_time(),
        ));
        app.upstream.push_since(upstream_record(
            "B",
            "acme/gadgets",
            "Fix the flaky test",
            base_time() + Duration::minutes(5),
        ));
        app.upstream.set_subject_detail(
            "acme/widgets",
            1,
            SubjectDetail {
                state: Some("open".to_string()),
                merged: Some(false),
                author_login: Some("dependabot[bot]".to_string()),
                number: Some(1),
                ..Default::default()
            },
        );
        app.upstream.set_subject_detail(
            "acme/gadgets",
            1,
            SubjectDetail {
                state: Some("open".to_string()),
                merged: Some(false),
                author_login: Some("alice".to_string()),
                number: Some(1),
                ..Default::default()
            },
        );

        let outcome = app
            .services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.created, 2);

        drain_jobs(&app).await;

        let a = notification_by_upstream_id(&app, "A").await.unwrap();
        assert!(a.archived);
        assert_eq!(tags_of(&app, a.id).await, vec!["deps"]);

        let b = notification_by_upstream_id(&app, "B").await.unwrap();
        assert!(!b.archived);
        assert!(tags_of(&app, b.id).await.is_empty());

        // Only B is left in the inbox.
        let inbox = app
            .services
            .notification_service
            .list_notifications("", 1, None, app.user_id)
            .await
            .unwrap();
        assert_eq!(inbox.total, 1);
        assert_eq!(inbox.rows[0].notification.upstream_id, "B");
    }

    #[rstest]
    #[tokio::test]
    async fn test_cursor_advances_to_max_updated_at(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let newest = base_time() + Duration::minutes(30);
        app.upstream
            .push_since(upstream_record("A", "acme/widgets", "Old", base_time()));
        app.upstream
            .push_since(upstream_record("B", "acme/widgets", "New", newest));

        app.services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();

        let state = sync_state(&app).await;
        assert_eq!(state.latest_notification_at, Some(newest));
        assert!(state.last_successful_poll.is_some());
        assert!(state.initial_sync_completed_at.is_some());

        // The next poll passes the cursor to the upstream client.
        app.services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        assert_eq!(
            *app.upstream.last_since.lock().unwrap(),
            Some(newest)
        );
    }

    #[rstest]
    #[tokio::test]
    async fn test_resync_does_not_duplicate_rows(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        app.upstream
            .push_since(upstream_record("A", "acme/widgets", "One", base_time()));

        app.services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        let second = app
            .services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        assert_eq!(second.created, 0);

        let listed = app
            .services
            .notification_service
            .list_notifications("in:anywhere", 1, None, app.user_id)
            .await
            .unwrap();
        assert_eq!(listed.total, 1);
    }

    /// Subject enrichment failures must not drop the notification row.
    #[rstest]
    #[tokio::test]
    async fn test_row_written_without_subject_detail(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        // No subject detail configured: the stub returns an empty detail.
        app.upstream
            .push_since(upstream_record("A", "acme/widgets", "Bare", base_time()));

        let outcome = app
            .services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);

        let a = notification_by_upstream_id(&app, "A").await.unwrap();
        assert_eq!(a.subject.title, "Bare");
        assert_eq!(a.subject.state, None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_rate_limit_surfaces_as_retryable(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        app.upstream.set_rate_limited(true);

        let result = app
            .services
            .sync_service
            .sync_notifications(app.user_id)
            .await;
        let err = result.expect_err("rate limited sync must fail");
        assert!(matches!(err, ForgeInboxError::RateLimited { .. }));
        assert!(err.is_retryable());

        // The cursor did not move.
        let state = sync_state(&app).await;
        assert_eq!(state.last_successful_poll, None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_rule_jobs_are_deduplicated(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        app.services
            .rule_service
            .create_rule(
                CreateRuleRequest {
                    name: "all".to_string(),
                    query: Some("repo:acme".to_string()),
                    view_id: None,
                    actions: RuleActions {
                        mark_read: true,
                        ..Default::default()
                    },
                    enabled: true,
                    apply_to_existing: false,
                },
                app.user_id,
            )
            .await
            .unwrap();
        app.upstream
            .push_since(upstream_record("A", "acme/widgets", "One", base_time()));

        app.services
            .sync_service
            .sync_notifications(app.user_id)
            .await
            .unwrap();
        let executed = drain_jobs(&app).await;
        assert_eq!(executed, 1);
    }
}

mod backfill {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Scenario: backfill ingests historical rows but never fires rules.
    #[rstest]
    #[tokio::test]
    async fn test_backfill_does_not_trigger_rules(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let tag = app
            .services
            .tag_service
            .create_tag(
                forge_inbox_api::forge_inbox::tag::service::CreateTagRequest {
                    name: "deps".to_string(),
                    color: None,
                },
                app.user_id,
            )
            .await
            .unwrap();
        app.services
            .rule_service
            .create_rule(
                CreateRuleRequest {
                    name: "dependabot".to_string(),
                    query: Some("author:dependabot".to_string()),
                    view_id: None,
                    actions: RuleActions {
                        archive: true,
                        assign_tags: vec![tag.id],
                        ..Default::default()
                    },
                    enabled: true,
                    apply_to_existing: false,
                },
                app.user_id,
            )
            .await
            .unwrap();

        let a_year_ago = base_time() - Duration::days(365);
        app.upstream.push_before(upstream_record(
            "C",
            "acme/widgets",
            "Bump lodash",
            a_year_ago,
        ));
        app.upstream.set_subject_detail(
            "acme/widgets",
            1,
            SubjectDetail {
                author_login: Some("dependabot[bot]".to_string()),
                ..Default::default()
            },
        );

        let outcome = app
            .services
            .sync_service
            .backfill(None, None, false, app.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.created, 1);

        // No rule jobs were enqueued at all.
        assert_eq!(drain_jobs(&app).await, 0);

        let c = notification_by_upstream_id(&app, "C").await.unwrap();
        assert!(!c.archived);
        assert!(tags_of(&app, c.id).await.is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_backfill_moves_the_oldest_cursor(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let oldest = base_time() - Duration::days(400);
        app.upstream.push_before(upstream_record(
            "C",
            "acme/widgets",
            "Ancient",
            oldest,
        ));
        app.upstream.push_before(upstream_record(
            "D",
            "acme/widgets",
            "Old",
            base_time() - Duration::days(100),
        ));

        app.services
            .sync_service
            .backfill(None, None, false, app.user_id)
            .await
            .unwrap();

        let state = sync_state(&app).await;
        assert_eq!(state.oldest_notification_synced_at, Some(oldest));
        // Backfill leaves the incremental cursor untouched.
        assert_eq!(state.latest_notification_at, None);
    }

    #[rstest]
    #[tokio::test]
    async fn test_backfill_honours_max_count(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        for i in 0..5 {
            app.upstream.push_before(upstream_record(
                &format!("C-{i}"),
                "acme/widgets",
                "Old",
                base_time() - Duration::days(10 + i),
            ));
        }

        let outcome = app
            .services
            .sync_service
            .backfill(None, Some(2), false, app.user_id)
            .await
            .unwrap();
        assert_eq!(outcome.fetched, 2);
    }
}
