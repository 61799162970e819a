use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::{sync::watch, task::JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use forge_inbox::{user::UpdateCheckInterval, JobId};

use crate::{
    forge_inbox::ForgeInboxError,
    jobs::{encode_payload, Job, JobKind, PollJob, UpdateCheckJob},
    repository::{
        commit,
        job::{JobRepository, NewJob},
        user::UserRepository,
        Repository,
    },
};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    /// How long an idle worker waits before polling the queue again.
    pub idle_poll_interval: Duration,
    pub lease_ttl: Duration,
    pub sweep_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: i64,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            worker_count: 4,
            idle_poll_interval: Duration::from_millis(500),
            lease_ttl: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(600),
            max_attempts: 5,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// A typed job handler. Handlers are registered per kind and must be
/// idempotent: the queue delivers at least once.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), ForgeInboxError>;
}

#[derive(Default)]
pub struct JobRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl JobRegistry {
    pub fn new() -> JobRegistry {
        JobRegistry::default()
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    fn get(&self, kind: JobKind) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Dispatches one job to its registered handler. A missing handler is
    /// a non-retryable error; the caller marks the job dead.
    pub async fn run_job(&self, job: &Job) -> Result<(), ForgeInboxError> {
        let Some(handler) = self.get(job.kind) else {
            return Err(ForgeInboxError::Unexpected(anyhow::anyhow!(
                "No handler registered for job kind {}",
                job.kind
            )));
        };
        handler.run(job).await
    }
}

/// `min(base * 2^(attempts-1), cap)` plus a jitter in `[0, base)`.
fn backoff_delay(config: &SchedulerConfig, attempts: i64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(20) as u32;
    let exponential = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(exponent))
        .min(config.backoff_cap);
    let jitter_ms = rand::rng().random_range(0..config.backoff_base.as_millis().max(1) as u64);
    exponential + Duration::from_millis(jitter_ms)
}

struct SchedulerInner {
    repository: Arc<Repository>,
    registry: JobRegistry,
    config: SchedulerConfig,
    /// Leases held by in-flight handlers, released on shutdown.
    active_leases: Mutex<HashMap<JobId, String>>,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Scheduler {
    pub fn new(
        repository: Arc<Repository>,
        registry: JobRegistry,
        config: SchedulerConfig,
    ) -> Scheduler {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Scheduler {
            inner: Arc::new(SchedulerInner {
                repository,
                registry,
                config,
                active_leases: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Spawns the worker pool, the lease janitor and the periodic
    /// triggers. Returns a handle used to stop everything.
    pub fn start(self) -> SchedulerHandle {
        let mut tasks = JoinSet::new();
        for worker_index in 0..self.inner.config.worker_count {
            let inner = self.inner.clone();
            let shutdown = self.shutdown_rx.clone();
            tasks.spawn(async move {
                worker_loop(inner, shutdown, worker_index).await;
            });
        }
        {
            let inner = self.inner.clone();
            let shutdown = self.shutdown_rx.clone();
            tasks.spawn(async move {
                janitor_loop(inner, shutdown).await;
            });
        }
        {
            let inner = self.inner.clone();
            let shutdown = self.shutdown_rx.clone();
            tasks.spawn(async move {
                trigger_loop(inner, shutdown).await;
            });
        }

        info!(
            "Scheduler started with {} workers",
            self.inner.config.worker_count
        );
        SchedulerHandle {
            inner: self.inner,
            shutdown_tx: self.shutdown_tx,
            tasks,
        }
    }
}

pub struct SchedulerHandle {
    inner: Arc<SchedulerInner>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl SchedulerHandle {
    /// Stops accepting new jobs, waits up to the grace period for
    /// in-flight handlers, then releases any leases still held so the next
    /// process start can resume them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);

        let drained = tokio::time::timeout(self.inner.config.shutdown_grace, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("Scheduler shutdown grace period elapsed, aborting workers");
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        let leases: Vec<(JobId, String)> = self
            .inner
            .active_leases
            .lock()
            .expect("active lease table poisoned")
            .drain()
            .collect();
        for (job_id, lease_token) in leases {
            if let Err(err) = release_lease(&self.inner.repository, job_id, &lease_token).await {
                error!("Failed to release lease for job {job_id} on shutdown: {err:?}");
            }
        }
        info!("Scheduler stopped");
    }
}

async fn release_lease(
    repository: &Repository,
    job_id: JobId,
    lease_token: &str,
) -> Result<(), ForgeInboxError> {
    let mut transaction = repository.begin().await?;
    repository
        .release_job(
            &mut transaction,
            job_id,
            lease_token,
            "interrupted by shutdown",
        )
        .await?;
    commit(transaction).await
}

async fn worker_loop(
    inner: Arc<SchedulerInner>,
    mut shutdown: watch::Receiver<bool>,
    worker_index: usize,
) {
    debug!("Job worker {worker_index} started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        match claim_and_run(&inner).await {
            Ok(true) => {}
            Ok(false) => {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(inner.config.idle_poll_interval) => {}
                }
            }
            Err(err) => {
                error!("Job worker {worker_index} failed to poll the queue: {err:?}");
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(inner.config.idle_poll_interval) => {}
                }
            }
        }
    }
    debug!("Job worker {worker_index} stopped");
}

/// Claims one due job and runs it to completion. Returns whether a job was
/// claimed, so idle workers can back off.
async fn claim_and_run(inner: &Arc<SchedulerInner>) -> Result<bool, ForgeInboxError> {
    let lease_token = Uuid::new_v4().to_string();
    let now = Utc::now();
    let lease_expires_at = now
        + chrono::Duration::from_std(inner.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));

    let mut transaction = inner.repository.begin().await?;
    let job = inner
        .repository
        .claim_due_job(&mut transaction, &lease_token, lease_expires_at, now)
        .await?;
    commit(transaction).await?;

    let Some(job) = job else {
        return Ok(false);
    };

    inner
        .active_leases
        .lock()
        .expect("active lease table poisoned")
        .insert(job.id, lease_token.clone());
    let result = run_with_heartbeat(inner, &job, &lease_token).await;
    inner
        .active_leases
        .lock()
        .expect("active lease table poisoned")
        .remove(&job.id);

    finish_job(inner, &job, &lease_token, result).await?;
    Ok(true)
}

async fn run_with_heartbeat(
    inner: &Arc<SchedulerInner>,
    job: &Job,
    lease_token: &str,
) -> Result<(), ForgeInboxError> {
    let heartbeat_interval = inner.config.lease_ttl / 3;
    let run = inner.registry.run_job(job);
    tokio::pin!(run);
    loop {
        tokio::select! {
            result = &mut run => return result,
            _ = tokio::time::sleep(heartbeat_interval) => {
                let renewed = renew_lease(inner, job, lease_token).await;
                if !renewed {
                    // The janitor already took the job back; finish the
                    // work (it must be idempotent) but the completion
                    // update below will be a no-op.
                    warn!("Lost the lease for job {} while it was running", job.id);
                }
            }
        }
    }
}

async fn renew_lease(inner: &Arc<SchedulerInner>, job: &Job, lease_token: &str) -> bool {
    let lease_expires_at = Utc::now()
        + chrono::Duration::from_std(inner.config.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
    let result = async {
        let mut transaction = inner.repository.begin().await?;
        let renewed = inner
            .repository
            .renew_job_lease(&mut transaction, job.id, lease_token, lease_expires_at)
            .await?;
        commit(transaction).await?;
        Ok::<bool, ForgeInboxError>(renewed)
    }
    .await;
    match result {
        Ok(renewed) => renewed,
        Err(err) => {
            warn!("Failed to renew lease for job {}: {err:?}", job.id);
            false
        }
    }
}

async fn finish_job(
    inner: &Arc<SchedulerInner>,
    job: &Job,
    lease_token: &str,
    result: Result<(), ForgeInboxError>,
) -> Result<(), ForgeInboxError> {
    let mut transaction = inner.repository.begin().await?;
    match result {
        Ok(()) => {
            inner
                .repository
                .complete_job(&mut transaction, job.id, lease_token)
                .await?;
            debug!("Job {} ({}) succeeded", job.id, job.kind);
        }
        Err(err) => {
            let retryable = err.is_retryable();
            let attempts_left = job.attempts < job.max_attempts;
            if retryable && attempts_left {
                let retry_at = Utc::now()
                    + chrono::Duration::from_std(backoff_delay(&inner.config, job.attempts))
                        .unwrap_or_else(|_| chrono::Duration::seconds(5));
                warn!(
                    "Job {} ({}) failed on attempt {}/{}, retrying at {retry_at}: {err:?}",
                    job.id, job.kind, job.attempts, job.max_attempts
                );
                inner
                    .repository
                    .fail_job(
                        &mut transaction,
                        job.id,
                        lease_token,
                        &format!("{err}"),
                        Some(retry_at),
                    )
                    .await?;
            } else {
                error!(
                    "Job {} ({}) is dead after attempt {}/{}: {err:?}",
                    job.id, job.kind, job.attempts, job.max_attempts
                );
                inner
                    .repository
                    .fail_job(&mut transaction, job.id, lease_token, &format!("{err}"), None)
                    .await?;
            }
        }
    }
    commit(transaction).await
}

async fn janitor_loop(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(inner.config.sweep_interval) => {}
        }
        if *shutdown.borrow() {
            break;
        }
        let swept = async {
            let mut transaction = inner.repository.begin().await?;
            let swept = inner
                .repository
                .sweep_expired_leases(&mut transaction, Utc::now())
                .await?;
            commit(transaction).await?;
            Ok::<u64, ForgeInboxError>(swept)
        }
        .await;
        match swept {
            Ok(0) => {}
            Ok(swept) => info!("Janitor returned {swept} expired jobs to the queue"),
            Err(err) => error!("Janitor sweep failed: {err:?}"),
        }
    }
}

/// Enqueues `poll` on the configured interval and `update_check` per user
/// settings. Dedup keys make each trigger a no-op while a job of that kind
/// is still pending or running.
async fn trigger_loop(inner: Arc<SchedulerInner>, mut shutdown: watch::Receiver<bool>) {
    let mut last_update_check: Option<chrono::DateTime<Utc>> = None;
    let mut startup_check_done = false;

    loop {
        let tick = trigger_tick(&inner, &mut last_update_check, &mut startup_check_done).await;
        let sleep_for = match tick {
            Ok(poll_interval) => poll_interval,
            Err(err) => {
                error!("Periodic trigger failed: {err:?}");
                Duration::from_secs(20)
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

async fn trigger_tick(
    inner: &Arc<SchedulerInner>,
    last_update_check: &mut Option<chrono::DateTime<Utc>>,
    startup_check_done: &mut bool,
) -> Result<Duration, ForgeInboxError> {
    let mut transaction = inner.repository.begin().await?;
    let user = inner
        .repository
        .get_or_create_user(&mut transaction)
        .await?;

    let now = Utc::now();
    let polling_muted = matches!(user.settings.mute_until, Some(until) if until > now);
    if !polling_muted {
        inner
            .repository
            .enqueue_job(
                &mut transaction,
                NewJob {
                    kind: JobKind::Poll,
                    payload: encode_payload(&PollJob { user_id: user.id })?,
                    dedup_key: Some("poll".to_string()),
                    run_at: now,
                    max_attempts: inner.config.max_attempts,
                },
            )
            .await?;
    }

    let update_check_due = match user.settings.update_check {
        UpdateCheckInterval::Never => false,
        UpdateCheckInterval::OnStartup => !*startup_check_done,
        interval => match (interval.period(), *last_update_check) {
            (Some(period), Some(last)) => now - last >= period,
            (Some(_), None) => true,
            (None, _) => false,
        },
    };
    if update_check_due {
        inner
            .repository
            .enqueue_job(
                &mut transaction,
                NewJob {
                    kind: JobKind::UpdateCheck,
                    payload: encode_payload(&UpdateCheckJob { user_id: user.id })?,
                    dedup_key: Some("update_check".to_string()),
                    run_at: now,
                    max_attempts: inner.config.max_attempts,
                },
            )
            .await?;
        *last_update_check = Some(now);
        *startup_check_done = true;
    }

    commit(transaction).await?;
    Ok(Duration::from_secs(user.settings.poll_interval_secs.max(1)))
}
