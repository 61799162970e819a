use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use rstest::*;

use forge_inbox::{
    notification::NotificationAction, rule::RuleActions, view::VIEW_DISPLAY_ORDER_STEP, ViewId,
};
use forge_inbox_api::forge_inbox::{
    rule::service::CreateRuleRequest,
    view::service::{CreateViewRequest, DeleteViewOutcome},
    ForgeInboxError,
};

use crate::helpers::{seed_notification, tested_app, TestedApp};

fn view_request(name: &str, query: &str) -> CreateViewRequest {
    CreateViewRequest {
        name: name.to_string(),
        description: None,
        icon: None,
        query: query.to_string(),
        is_default: false,
    }
}

async fn unread_count_of(app: &TestedApp, slug: &str) -> i64 {
    app.services
        .view_service
        .list_views(app.user_id)
        .await
        .unwrap()
        .into_iter()
        .find(|view| view.slug == slug)
        .unwrap_or_else(|| panic!("view {slug} not listed"))
        .unread_count
}

mod builtin_views {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    #[tokio::test]
    async fn test_list_views_starts_with_builtins(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let views = app.services.view_service.list_views(app.user_id).await.unwrap();
        let slugs: Vec<&str> = views.iter().map(|view| view.slug.as_str()).collect();
        assert_eq!(
            slugs,
            vec!["inbox", "everything", "archive", "snoozed", "starred"]
        );
        assert!(views.iter().all(|view| view.builtin));
    }

    #[rstest]
    #[tokio::test]
    async fn test_muted_notification_only_in_everything(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let notification = seed_notification(&app, "n-1", "acme/widgets", "Muted", None).await;
        app.services
            .notification_service
            .apply_action(notification.id, NotificationAction::Mute, app.user_id)
            .await
            .unwrap();

        assert_eq!(unread_count_of(&app, "inbox").await, 0);
        assert_eq!(unread_count_of(&app, "archive").await, 0);
        assert_eq!(unread_count_of(&app, "snoozed").await, 0);
        assert_eq!(unread_count_of(&app, "starred").await, 0);
        assert_eq!(unread_count_of(&app, "everything").await, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_future_snooze_moves_to_snoozed_view(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let notification = seed_notification(&app, "n-1", "acme/widgets", "Later", None).await;
        app.services
            .notification_service
            .apply_action(
                notification.id,
                NotificationAction::Snooze {
                    until: Utc::now() + Duration::hours(2),
                },
                app.user_id,
            )
            .await
            .unwrap();

        assert_eq!(unread_count_of(&app, "inbox").await, 0);
        assert_eq!(unread_count_of(&app, "snoozed").await, 1);
    }

    /// An elapsed snooze needs no cleanup job: the record is back in the
    /// inbox by query semantics alone.
    #[rstest]
    #[tokio::test]
    async fn test_elapsed_snooze_is_active_again(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let notification = seed_notification(&app, "n-1", "acme/widgets", "Now", None).await;
        let repository = &app.services.repository;
        let mut transaction = repository.begin().await.unwrap();
        use forge_inbox_api::repository::notification::NotificationRepository;
        repository
            .apply_action(
                &mut transaction,
                notification.id,
                &NotificationAction::Snooze {
                    until: Utc::now() - Duration::hours(1),
                },
                app.user_id,
            )
            .await
            .unwrap();
        transaction.commit().await.unwrap();

        assert_eq!(unread_count_of(&app, "snoozed").await, 0);
        assert_eq!(unread_count_of(&app, "inbox").await, 1);

        let snoozed = app
            .services
            .notification_service
            .list_notifications("is:snoozed", 1, None, app.user_id)
            .await
            .unwrap();
        assert_eq!(snoozed.total, 0);
    }

    #[rstest]
    #[tokio::test]
    async fn test_unread_counts_follow_reads(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let first = seed_notification(&app, "n-1", "acme/widgets", "One", None).await;
        seed_notification(&app, "n-2", "acme/widgets", "Two", None).await;

        assert_eq!(unread_count_of(&app, "inbox").await, 2);

        app.services
            .notification_service
            .apply_action(first.id, NotificationAction::MarkRead, app.user_id)
            .await
            .unwrap();
        assert_eq!(unread_count_of(&app, "inbox").await, 1);
    }
}

mod user_views {
    use super::*;
    use pretty_assertions::assert_eq;

    #[rstest]
    #[tokio::test]
    async fn test_create_and_count_user_view(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        seed_notification(&app, "n-1", "acme/widgets", "Bump serde", Some("dependabot[bot]"))
            .await;
        seed_notification(&app, "n-2", "acme/widgets", "A bug", Some("alice")).await;

        let view = app
            .services
            .view_service
            .create_view(view_request("Bot PRs", "author:dependabot"), app.user_id)
            .await
            .unwrap();
        assert_eq!(view.slug, "bot-prs");
        assert_eq!(view.display_order, VIEW_DISPLAY_ORDER_STEP);

        assert_eq!(unread_count_of(&app, "bot-prs").await, 1);
    }

    #[rstest]
    #[tokio::test]
    async fn test_reserved_slug_is_rejected(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        for name in ["Inbox", "Everything", "Done", "Archive", "Snoozed", "Starred"] {
            let result = app
                .services
                .view_service
                .create_view(view_request(name, "is:unread"), app.user_id)
                .await;
            assert!(
                matches!(result, Err(ForgeInboxError::InvalidQuery(_))),
                "view name {name} should be reserved"
            );
        }
    }

    #[rstest]
    #[tokio::test]
    async fn test_invalid_query_is_rejected(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let result = app
            .services
            .view_service
            .create_view(view_request("Broken", "label:oops"), app.user_id)
            .await;
        assert!(matches!(result, Err(ForgeInboxError::InvalidQuery(_))));
    }

    #[rstest]
    #[tokio::test]
    async fn test_duplicate_slug_conflicts(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        app.services
            .view_service
            .create_view(view_request("Bot PRs", "author:bot"), app.user_id)
            .await
            .unwrap();
        let result = app
            .services
            .view_service
            .create_view(view_request("Bot PRs", "author:bot"), app.user_id)
            .await;
        assert!(matches!(result, Err(ForgeInboxError::AlreadyExists { .. })));
    }

    #[rstest]
    #[tokio::test]
    async fn test_reorder_rewrites_display_order(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let first = app
            .services
            .view_service
            .create_view(view_request("First", "is:unread"), app.user_id)
            .await
            .unwrap();
        let second = app
            .services
            .view_service
            .create_view(view_request("Second", "is:starred"), app.user_id)
            .await
            .unwrap();

        app.services
            .view_service
            .reorder_views(&[second.id.clone(), first.id.clone()], app.user_id)
            .await
            .unwrap();

        let views = app.services.view_service.list_views(app.user_id).await.unwrap();
        let user_views: Vec<_> = views.into_iter().filter(|view| !view.builtin).collect();
        assert_eq!(user_views[0].slug, "second");
        assert_eq!(user_views[0].display_order, VIEW_DISPLAY_ORDER_STEP);
        assert_eq!(user_views[1].slug, "first");
        assert_eq!(user_views[1].display_order, 2 * VIEW_DISPLAY_ORDER_STEP);
    }

    #[rstest]
    #[tokio::test]
    async fn test_reorder_rejects_builtin_ids(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let result = app
            .services
            .view_service
            .reorder_views(&[ViewId::builtin("inbox")], app.user_id)
            .await;
        assert!(matches!(
            result,
            Err(ForgeInboxError::InvalidInputData { .. })
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn test_delete_view_with_linked_rules_requires_force(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let view = app
            .services
            .view_service
            .create_view(view_request("Bots", "author:bot"), app.user_id)
            .await
            .unwrap();
        app.services
            .rule_service
            .create_rule(
                CreateRuleRequest {
                    name: "bots".to_string(),
                    query: None,
                    view_id: Some(view.id.clone()),
                    actions: RuleActions {
                        archive: true,
                        ..Default::default()
                    },
                    enabled: true,
                    apply_to_existing: false,
                },
                app.user_id,
            )
            .await
            .unwrap();

        let outcome = app
            .services
            .view_service
            .delete_view(&view.id, false, app.user_id)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            DeleteViewOutcome::LinkedRules {
                linked_rule_count: 1
            }
        );
        // The view is still there.
        assert!(app
            .services
            .view_service
            .get_view(&view.id, app.user_id)
            .await
            .is_ok());

        let outcome = app
            .services
            .view_service
            .delete_view(&view.id, true, app.user_id)
            .await
            .unwrap();
        assert_eq!(outcome, DeleteViewOutcome::Deleted);
        assert!(app.services.rule_service.list_rules(app.user_id).await.unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn test_builtin_views_cannot_be_deleted(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let result = app
            .services
            .view_service
            .delete_view(&ViewId::builtin("inbox"), true, app.user_id)
            .await;
        assert!(matches!(
            result,
            Err(ForgeInboxError::InvalidInputData { .. })
        ));
    }
}

mod count_cache {
    use super::*;
    use pretty_assertions::assert_eq;
    use forge_inbox_api::{build_pool, build_services};
    use std::sync::Arc;

    /// With a non-zero TTL the second read within the window is served
    /// from the cache, and a mutation invalidates it immediately.
    #[rstest]
    #[tokio::test]
    async fn test_counts_are_cached_and_invalidated(#[future] tested_app: TestedApp) {
        let app = tested_app.await;
        let mut settings = app.settings.clone();
        settings.scheduler.count_cache_ttl_secs = 60;

        let database_path = std::env::temp_dir().join(format!(
            "forge-inbox-cache-test-{}.db",
            uuid::Uuid::new_v4()
        ));
        let pool = Arc::new(
            build_pool(&format!("sqlite://{}", database_path.display()))
                .await
                .unwrap(),
        );
        let services = build_services(
            pool,
            &settings,
            app.upstream.clone(),
            Arc::new(crate::helpers::StubCredentialStore::default()),
        );
        let user_id = services.user_service.get_user().await.unwrap().id;
        let cached_app = TestedApp {
            services,
            upstream: app.upstream.clone(),
            user_id,
            settings,
        };

        let notification =
            seed_notification(&cached_app, "n-1", "acme/widgets", "One", None).await;
        assert_eq!(unread_count_of(&cached_app, "inbox").await, 1);

        // A mutation through the service invalidates the cached count.
        cached_app
            .services
            .notification_service
            .apply_action(notification.id, NotificationAction::MarkRead, user_id)
            .await
            .unwrap();
        assert_eq!(unread_count_of(&cached_app, "inbox").await, 0);
    }
}
