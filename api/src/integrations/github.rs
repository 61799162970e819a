use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{
    header::{HeaderMap, HeaderValue},
    StatusCode,
};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::{SpanBackendWithUrl, TracingMiddleware};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use forge_inbox::{
    notification::SubjectType,
    upstream::{
        NotificationRecord, RepoRecord, SubjectDetail, SubjectRecord, Timeline, TimelineEvent,
    },
};

use crate::{
    credentials::CredentialStore,
    forge_inbox::ForgeInboxError,
    integrations::{NotificationRecordStream, UpstreamClient, APP_USER_AGENT},
};

static GITHUB_BASE_URL: &str = "https://api.github.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct GithubClient {
    github_base_url: String,
    page_size: usize,
    credentials: Arc<dyn CredentialStore>,
}

impl GithubClient {
    pub fn new(
        github_base_url: Option<String>,
        page_size: usize,
        credentials: Arc<dyn CredentialStore>,
    ) -> GithubClient {
        GithubClient {
            github_base_url: github_base_url.unwrap_or_else(|| GITHUB_BASE_URL.to_string()),
            page_size,
            credentials,
        }
    }

    async fn client(&self) -> Result<ClientWithMiddleware, ForgeInboxError> {
        let token = self.credentials.get_token().await?;
        build_github_client(&token)
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn fetch_notifications_page(
        &self,
        page: u32,
        since: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        include_read: bool,
    ) -> Result<Vec<NotificationRecord>, ForgeInboxError> {
        let mut url = format!(
            "{}/notifications?page={page}&per_page={}",
            self.github_base_url, self.page_size
        );
        if include_read {
            url.push_str("&all=true");
        }
        if let Some(since) = since {
            url.push_str(&format!("&since={}", since.to_rfc3339()));
        }
        if let Some(before) = before {
            url.push_str(&format!("&before={}", before.to_rfc3339()));
        }

        let response = self
            .client()
            .await?
            .get(&url)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_github_response(response, "list notifications").await?;
        let notifications: Vec<GithubNotification> = response
            .json()
            .await
            .context("Failed to parse Github notifications response")?;

        Ok(notifications
            .into_iter()
            .map(NotificationRecord::from)
            .collect())
    }

    fn paged_notifications(
        &self,
        since: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        include_read: bool,
    ) -> NotificationRecordStream<'_> {
        let page_size = self.page_size;
        stream::try_unfold((1u32, false), move |(page, done)| async move {
            if done {
                return Ok::<_, ForgeInboxError>(None);
            }
            let records = self
                .fetch_notifications_page(page, since, before, include_read)
                .await?;
            let is_last_page = records.len() < page_size;
            Ok(Some((records, (page + 1, is_last_page))))
        })
        .map_ok(|records| stream::iter(records.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    async fn fetch_resource(
        &self,
        url: &str,
        what: &str,
    ) -> Result<serde_json::Value, ForgeInboxError> {
        let response = self
            .client()
            .await?
            .get(url)
            .send()
            .await
            .map_err(upstream_error)?;
        let response = check_github_response(response, what).await?;
        Ok(response
            .json()
            .await
            .with_context(|| format!("Failed to parse Github response for {what}"))?)
    }
}

#[async_trait]
impl UpstreamClient for GithubClient {
    fn list_notifications_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> NotificationRecordStream<'_> {
        self.paged_notifications(since, None, true)
    }

    fn list_notifications_before(
        &self,
        before: DateTime<Utc>,
        unread_only: bool,
        max_count: Option<u32>,
    ) -> NotificationRecordStream<'_> {
        let stream = self.paged_notifications(None, Some(before), !unread_only);
        match max_count {
            Some(max_count) => stream.take(max_count as usize).boxed(),
            None => stream,
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn get_subject(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        kind: &SubjectType,
    ) -> Result<SubjectDetail, ForgeInboxError> {
        let base = &self.github_base_url;
        match kind {
            SubjectType::PullRequest => {
                let value = self
                    .fetch_resource(
                        &format!("{base}/repos/{owner}/{repo}/pulls/{number}"),
                        "pull request",
                    )
                    .await?;
                Ok(SubjectDetail {
                    state: value
                        .get("state")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    merged: value.get("merged").and_then(|v| v.as_bool()),
                    state_reason: None,
                    author_login: author_login(&value),
                    number: value.get("number").and_then(|v| v.as_i64()),
                    raw: Some(value),
                })
            }
            SubjectType::Issue | SubjectType::Discussion => {
                let value = self
                    .fetch_resource(
                        &format!("{base}/repos/{owner}/{repo}/issues/{number}"),
                        "issue",
                    )
                    .await?;
                Ok(SubjectDetail {
                    state: value
                        .get("state")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    merged: None,
                    state_reason: value
                        .get("state_reason")
                        .and_then(|v| v.as_str())
                        .map(str::to_string),
                    author_login: author_login(&value),
                    number: value.get("number").and_then(|v| v.as_i64()),
                    raw: Some(value),
                })
            }
            // Releases, commits and check suites carry everything the
            // triage surface needs in the notification itself.
            _ => Ok(SubjectDetail::default()),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn list_timeline(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        per_page: u32,
        page: u32,
    ) -> Result<Timeline, ForgeInboxError> {
        let value = self
            .fetch_resource(
                &format!(
                    "{}/repos/{owner}/{repo}/issues/{number}/timeline?per_page={per_page}&page={page}",
                    self.github_base_url
                ),
                "timeline",
            )
            .await?;
        let events: Vec<GithubTimelineEvent> =
            serde_json::from_value(value).context("Failed to parse Github timeline response")?;
        Ok(Timeline {
            events: events.into_iter().map(TimelineEvent::from).collect(),
        })
    }

    #[tracing::instrument(level = "debug", skip(self), err)]
    async fn viewer(&self) -> Result<String, ForgeInboxError> {
        let value = self
            .fetch_resource(&format!("{}/user", self.github_base_url), "viewer")
            .await?;
        value
            .get("login")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                ForgeInboxError::Unexpected(anyhow!(
                    "Github viewer response is missing the login field"
                ))
            })
    }
}

fn author_login(value: &serde_json::Value) -> Option<String> {
    value
        .get("user")
        .and_then(|user| user.get("login"))
        .and_then(|login| login.as_str())
        .map(str::to_string)
}

fn build_github_client(
    access_token: &SecretString,
) -> Result<ClientWithMiddleware, ForgeInboxError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        "Accept",
        HeaderValue::from_static("application/vnd.github.v3+json"),
    );
    let mut auth_header_value: HeaderValue =
        format!("Bearer {}", access_token.expose_secret())
            .parse()
            .context("Failed to build the Github authorization header")?;
    auth_header_value.set_sensitive(true);
    headers.insert("Authorization", auth_header_value);

    let reqwest_client = reqwest::Client::builder()
        .default_headers(headers)
        .user_agent(APP_USER_AGENT)
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .context("Failed to build the Github client")?;
    Ok(ClientBuilder::new(reqwest_client)
        .with(TracingMiddleware::<SpanBackendWithUrl>::new())
        .build())
}

fn upstream_error(err: reqwest_middleware::Error) -> ForgeInboxError {
    ForgeInboxError::UpstreamUnavailable(anyhow::Error::new(err))
}

/// Maps Github error responses onto the error taxonomy: auth failures and
/// rate exhaustion are distinguished kinds, server errors are retryable
/// outages.
async fn check_github_response(
    response: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, ForgeInboxError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::UNAUTHORIZED {
        return Err(ForgeInboxError::Unauthorized(format!(
            "Github rejected the configured token while trying to {what}"
        )));
    }

    let rate_limited = status == StatusCode::TOO_MANY_REQUESTS
        || (status == StatusCode::FORBIDDEN
            && response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok())
                == Some("0"));
    if rate_limited {
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        return Err(ForgeInboxError::RateLimited { retry_after });
    }

    if status == StatusCode::NOT_FOUND {
        return Err(ForgeInboxError::ItemNotFound(format!(
            "Github resource not found while trying to {what}"
        )));
    }

    if status.is_server_error() {
        return Err(ForgeInboxError::UpstreamUnavailable(anyhow!(
            "Github returned {status} while trying to {what}"
        )));
    }

    Err(ForgeInboxError::Unexpected(anyhow!(
        "Github returned {status} while trying to {what}"
    )))
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubNotification {
    pub id: String,
    pub unread: bool,
    pub reason: String,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub subject: GithubSubject,
    pub repository: GithubRepository,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubSubject {
    pub title: String,
    pub url: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubRepository {
    pub id: i64,
    pub full_name: String,
    pub private: bool,
    pub default_branch: Option<String>,
    pub owner: GithubOwner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubTimelineEvent {
    event: Option<String>,
    actor: Option<GithubOwner>,
    created_at: Option<DateTime<Utc>>,
    body: Option<String>,
}

impl From<GithubNotification> for NotificationRecord {
    fn from(notification: GithubNotification) -> Self {
        NotificationRecord {
            upstream_id: notification.id,
            reason: notification.reason,
            unread: notification.unread,
            updated_at: notification.updated_at,
            last_read_at: notification.last_read_at,
            repo: RepoRecord {
                upstream_id: notification.repository.id.to_string(),
                full_name: notification.repository.full_name,
                owner_login: notification.repository.owner.login,
                private: notification.repository.private,
                default_branch: notification.repository.default_branch,
            },
            subject: SubjectRecord {
                title: notification.subject.title,
                kind: SubjectType::from_kind(&notification.subject.kind),
                url: notification
                    .subject
                    .url
                    .as_deref()
                    .and_then(|url| Url::parse(url).ok()),
            },
        }
    }
}

impl From<GithubTimelineEvent> for TimelineEvent {
    fn from(event: GithubTimelineEvent) -> Self {
        TimelineEvent {
            event: event.event.unwrap_or_default(),
            actor_login: event.actor.map(|actor| actor.login),
            created_at: event.created_at,
            body: event.body,
        }
    }
}
