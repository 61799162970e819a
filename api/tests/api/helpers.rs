use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream;
use rstest::*;
use secrecy::SecretString;
use uuid::Uuid;

use forge_inbox::{
    notification::{Notification, SubjectType},
    upstream::{NotificationRecord, RepoRecord, SubjectDetail, SubjectRecord, Timeline},
    NotificationId, UserId,
};
use forge_inbox_api::{
    build_pool, build_services,
    configuration::Settings,
    credentials::CredentialStore,
    forge_inbox::{ForgeInboxError, UpsertStatus},
    integrations::{NotificationRecordStream, UpstreamClient},
    jobs::JobStatus,
    repository::{
        job::JobRepository,
        notification::{NotificationDraft, NotificationRepository},
        repo::RepoRepository,
    },
    scheduler::SchedulerConfig,
    Services,
};

pub struct TestedApp {
    pub services: Services,
    pub upstream: Arc<StubUpstreamClient>,
    pub user_id: UserId,
    pub settings: Settings,
}

#[fixture]
pub fn settings() -> Settings {
    let mut settings = Settings::new().expect("Cannot load test configuration");
    settings.application.data_dir = Some(std::env::temp_dir().join("forge-inbox-tests"));
    // Count caching is exercised explicitly where needed; everywhere else
    // tests want fresh counts.
    settings.scheduler.count_cache_ttl_secs = 0;
    settings.sync.concurrency = 4;
    settings
}

#[fixture]
pub async fn tested_app(settings: Settings) -> TestedApp {
    let database_path = std::env::temp_dir().join(format!(
        "forge-inbox-test-{}.db",
        Uuid::new_v4()
    ));
    let database_url = format!("sqlite://{}", database_path.display());
    let pool = Arc::new(
        build_pool(&database_url)
            .await
            .expect("Failed to open the test datastore"),
    );

    let upstream = Arc::new(StubUpstreamClient::default());
    let credentials = Arc::new(StubCredentialStore::default());
    let services = build_services(pool, &settings, upstream.clone(), credentials);

    let user_id = services
        .user_service
        .get_user()
        .await
        .expect("Failed to create the test user")
        .id;

    TestedApp {
        services,
        upstream,
        user_id,
        settings,
    }
}

pub fn test_scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        worker_count: 2,
        idle_poll_interval: std::time::Duration::from_millis(20),
        lease_ttl: std::time::Duration::from_secs(60),
        sweep_interval: std::time::Duration::from_millis(50),
        backoff_base: std::time::Duration::from_millis(10),
        backoff_cap: std::time::Duration::from_millis(100),
        max_attempts: 5,
        shutdown_grace: std::time::Duration::from_secs(2),
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 7, 1, 12, 0, 0).unwrap()
}

pub fn upstream_record(
    upstream_id: &str,
    repo_full_name: &str,
    title: &str,
    updated_at: DateTime<Utc>,
) -> NotificationRecord {
    let (owner, _) = repo_full_name
        .split_once('/')
        .expect("repo full name must be owner/name");
    NotificationRecord {
        upstream_id: upstream_id.to_string(),
        reason: "subscribed".to_string(),
        unread: true,
        updated_at,
        last_read_at: None,
        repo: RepoRecord {
            upstream_id: format!("repo-{repo_full_name}"),
            full_name: repo_full_name.to_string(),
            owner_login: owner.to_string(),
            private: false,
            default_branch: Some("main".to_string()),
        },
        subject: SubjectRecord {
            title: title.to_string(),
            kind: SubjectType::PullRequest,
            url: Some(
                format!("https://api.github.com/repos/{repo_full_name}/pulls/1")
                    .parse()
                    .unwrap(),
            ),
        },
    }
}

/// Writes a notification row directly through the store, bypassing sync.
/// Returns the created notification.
pub async fn seed_notification(
    app: &TestedApp,
    upstream_id: &str,
    repo_full_name: &str,
    title: &str,
    author_login: Option<&str>,
) -> Notification {
    let record = upstream_record(upstream_id, repo_full_name, title, base_time());
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    let repo = repository
        .upsert_repo(&mut transaction, &record.repo, app.user_id)
        .await
        .expect("repo upsert failed");
    let upserted = repository
        .create_or_update_notification(
            &mut transaction,
            NotificationDraft {
                upstream_id: upstream_id.to_string(),
                repo_id: repo.id,
                subject: forge_inbox::notification::Subject {
                    kind: SubjectType::PullRequest,
                    title: title.to_string(),
                    number: Some(1),
                    state: Some("open".to_string()),
                    merged: Some(false),
                    state_reason: None,
                    raw: None,
                },
                reason: "subscribed".to_string(),
                author_login: author_login.map(str::to_string),
                unread: true,
                upstream_updated_at: base_time(),
            },
            app.user_id,
        )
        .await
        .expect("notification upsert failed");
    transaction.commit().await.expect("commit failed");

    match upserted {
        UpsertStatus::Created(notification) => notification,
        other => panic!("Expected a created notification, got {other:?}"),
    }
}

/// Claims and runs queued jobs through the registered handlers until the
/// queue is drained. Jobs are executed inline, not via the scheduler.
pub async fn drain_jobs(app: &TestedApp) -> usize {
    let registry_services = &app.services;
    let registry = forge_inbox_api::build_job_registry(registry_services);
    let repository = &app.services.repository;
    let mut executed = 0usize;

    loop {
        let lease_token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut transaction = repository.begin().await.expect("begin failed");
        let job = repository
            .claim_due_job(
                &mut transaction,
                &lease_token,
                now + chrono::Duration::seconds(60),
                now,
            )
            .await
            .expect("claim failed");
        transaction.commit().await.expect("commit failed");

        let Some(job) = job else { break };
        let result = registry
            .run_job(&job)
            .await;
        let mut transaction = repository.begin().await.expect("begin failed");
        match result {
            Ok(()) => {
                repository
                    .complete_job(&mut transaction, job.id, &lease_token)
                    .await
                    .expect("complete failed");
            }
            Err(err) => {
                repository
                    .fail_job(&mut transaction, job.id, &lease_token, &format!("{err}"), None)
                    .await
                    .expect("fail failed");
            }
        }
        transaction.commit().await.expect("commit failed");
        executed += 1;
    }
    executed
}

pub async fn job_statuses(app: &TestedApp) -> HashMap<String, JobStatus> {
    use sqlx::Row;
    let rows = sqlx::query("SELECT id, status FROM job")
        .fetch_all(&*app.services.repository.pool)
        .await
        .expect("Failed to list jobs");
    rows.into_iter()
        .map(|row| {
            let id: String = row.get("id");
            let status: String = row.get("status");
            (
                id,
                JobStatus::from_status(&status).expect("unknown job status"),
            )
        })
        .collect()
}

pub async fn notification_by_upstream_id(
    app: &TestedApp,
    upstream_id: &str,
) -> Option<Notification> {
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    repository
        .get_notification_for_upstream_id(&mut transaction, upstream_id, app.user_id)
        .await
        .expect("lookup failed")
}

pub async fn tags_of(app: &TestedApp, notification_id: NotificationId) -> Vec<String> {
    let repository = &app.services.repository;
    let mut transaction = repository.begin().await.expect("begin failed");
    let tags = repository
        .tags_for_notifications(&mut transaction, &[notification_id])
        .await
        .expect("tag lookup failed");
    tags.into_values()
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|tag| tag.slug)
        .collect()
}

#[derive(Default)]
pub struct StubUpstreamClient {
    pub since_records: Mutex<Vec<NotificationRecord>>,
    pub before_records: Mutex<Vec<NotificationRecord>>,
    pub subject_details: Mutex<HashMap<(String, i64), SubjectDetail>>,
    pub rate_limited: Mutex<bool>,
    pub subject_calls: Mutex<usize>,
    pub last_since: Mutex<Option<DateTime<Utc>>>,
}

impl StubUpstreamClient {
    pub fn push_since(&self, record: NotificationRecord) {
        self.since_records
            .lock()
            .expect("stub lock poisoned")
            .push(record);
    }

    pub fn push_before(&self, record: NotificationRecord) {
        self.before_records
            .lock()
            .expect("stub lock poisoned")
            .push(record);
    }

    pub fn set_subject_detail(&self, repo_full_name: &str, number: i64, detail: SubjectDetail) {
        self.subject_details
            .lock()
            .expect("stub lock poisoned")
            .insert((repo_full_name.to_string(), number), detail);
    }

    pub fn set_rate_limited(&self, rate_limited: bool) {
        *self.rate_limited.lock().expect("stub lock poisoned") = rate_limited;
    }
}

#[async_trait]
impl UpstreamClient for StubUpstreamClient {
    fn list_notifications_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> NotificationRecordStream<'_> {
        *self.last_since.lock().expect("stub lock poisoned") = since;
        if *self.rate_limited.lock().expect("stub lock poisoned") {
            return Box::pin(stream::iter(vec![Err(ForgeInboxError::RateLimited {
                retry_after: None,
            })]));
        }
        let records = self
            .since_records
            .lock()
            .expect("stub lock poisoned")
            .clone();
        Box::pin(stream::iter(records.into_iter().map(Ok)))
    }

    fn list_notifications_before(
        &self,
        _before: DateTime<Utc>,
        _unread_only: bool,
        max_count: Option<u32>,
    ) -> NotificationRecordStream<'_> {
        let mut records = self
            .before_records
            .lock()
            .expect("stub lock poisoned")
            .clone();
        if let Some(max_count) = max_count {
            records.truncate(max_count as usize);
        }
        Box::pin(stream::iter(records.into_iter().map(Ok)))
    }

    async fn get_subject(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        _kind: &SubjectType,
    ) -> Result<SubjectDetail, ForgeInboxError> {
        *self.subject_calls.lock().expect("stub lock poisoned") += 1;
        let key = (format!("{owner}/{repo}"), number);
        Ok(self
            .subject_details
            .lock()
            .expect("stub lock poisoned")
            .get(&key)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_timeline(
        &self,
        _owner: &str,
        _repo: &str,
        _number: i64,
        _per_page: u32,
        _page: u32,
    ) -> Result<Timeline, ForgeInboxError> {
        Ok(Timeline::default())
    }

    async fn viewer(&self) -> Result<String, ForgeInboxError> {
        Ok("octocat".to_string())
    }
}

#[derive(Default)]
pub struct StubCredentialStore {
    token: Mutex<Option<String>>,
}

#[async_trait]
impl CredentialStore for StubCredentialStore {
    async fn get_token(&self) -> Result<SecretString, ForgeInboxError> {
        self.token
            .lock()
            .expect("stub lock poisoned")
            .clone()
            .map(SecretString::new)
            .ok_or(ForgeInboxError::NoTokenConfigured)
    }

    async fn set_token(&self, token: SecretString) -> Result<(), ForgeInboxError> {
        use secrecy::ExposeSecret;
        *self.token.lock().expect("stub lock poisoned") = Some(token.expose_secret().clone());
        Ok(())
    }

    async fn clear_token(&self) -> Result<(), ForgeInboxError> {
        *self.token.lock().expect("stub lock poisoned") = None;
        Ok(())
    }
}
