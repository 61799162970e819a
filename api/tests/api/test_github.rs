use std::sync::Arc;

use pretty_assertions::assert_eq;
use rstest::*;
use secrecy::SecretString;
use serde_json::json;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

use forge_inbox::notification::SubjectType;
use forge_inbox_api::{
    credentials::CredentialStore,
    forge_inbox::ForgeInboxError,
    integrations::{github::GithubClient, UpstreamClient},
};

use crate::helpers::StubCredentialStore;

async fn github_client(mock_server: &MockServer) -> GithubClient {
    let credentials = Arc::new(StubCredentialStore::default());
    credentials
        .set_token(SecretString::new("test_token".to_string()))
        .await
        .unwrap();
    GithubClient::new(Some(mock_server.uri()), 2, credentials)
}

fn notification_json(id: &str, title: &str) -> serde_json::Value {
    json!({
        "id": id,
        "unread": true,
        "reason": "review_requested",
        "updated_at": "2025-07-01T12:00:00Z",
        "last_read_at": null,
        "subject": {
            "title": title,
            "url": "https://api.github.com/repos/acme/widgets/pulls/42",
            "type": "PullRequest"
        },
        "repository": {
            "id": 9001,
            "full_name": "acme/widgets",
            "private": false,
            "default_branch": "main",
            "owner": { "login": "acme" }
        }
    })
}

#[rstest]
#[tokio::test]
async fn test_list_notifications_paginates_and_authenticates() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .and(header("authorization", "Bearer test_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            notification_json("1", "First"),
            notification_json("2", "Second"),
        ])))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            notification_json("3", "Third"),
        ])))
        .mount(&mock_server)
        .await;

    let client = github_client(&mock_server).await;
    use futures::TryStreamExt;
    let records: Vec<_> = client
        .list_notifications_since(None)
        .try_collect()
        .await
        .unwrap();

    assert_eq!(records.len(), 3);
    assert_eq!(records[0].upstream_id, "1");
    assert_eq!(records[0].repo.full_name, "acme/widgets");
    assert_eq!(records[0].subject.kind, SubjectType::PullRequest);
    assert_eq!(records[0].subject.number(), Some(42));
}

#[rstest]
#[tokio::test]
async fn test_rate_limit_is_a_distinguished_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/notifications"))
        .respond_with(
            ResponseTemplate::new(403)
                .insert_header("x-ratelimit-remaining", "0")
                .insert_header("retry-after", "30"),
        )
        .mount(&mock_server)
        .await;

    let client = github_client(&mock_server).await;
    use futures::TryStreamExt;
    let result: Result<Vec<_>, _> = client.list_notifications_since(None).try_collect().await;

    let err = result.expect_err("rate limited response must fail");
    assert!(matches!(
        err,
        ForgeInboxError::RateLimited {
            retry_after: Some(retry_after)
        } if retry_after.as_secs() == 30
    ));
}

#[rstest]
#[tokio::test]
async fn test_auth_failure_is_a_distinguished_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&mock_server)
        .await;

    let client = github_client(&mock_server).await;
    let result = client.viewer().await;
    assert!(matches!(result, Err(ForgeInboxError::Unauthorized(_))));
}

#[rstest]
#[tokio::test]
async fn test_missing_token_short_circuits() {
    let mock_server = MockServer::start().await;
    let client = GithubClient::new(
        Some(mock_server.uri()),
        2,
        Arc::new(StubCredentialStore::default()),
    );

    let result = client.viewer().await;
    assert!(matches!(result, Err(ForgeInboxError::NoTokenConfigured)));
    assert!(mock_server.received_requests().await.unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_get_subject_maps_pull_request_fields() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repos/acme/widgets/pulls/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "number": 42,
            "state": "closed",
            "merged": true,
            "user": { "login": "octocat" }
        })))
        .mount(&mock_server)
        .await;

    let client = github_client(&mock_server).await;
    let detail = client
        .get_subject("acme", "widgets", 42, &SubjectType::PullRequest)
        .await
        .unwrap();

    assert_eq!(detail.state.as_deref(), Some("closed"));
    assert_eq!(detail.merged, Some(true));
    assert_eq!(detail.author_login.as_deref(), Some("octocat"));
    assert_eq!(detail.number, Some(42));
}
