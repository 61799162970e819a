use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use forge_inbox::{
    notification::SubjectType,
    upstream::{NotificationRecord, SubjectDetail, Timeline},
};

use crate::forge_inbox::ForgeInboxError;

pub mod github;

pub static APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Paged stream of upstream notifications. Items surface in upstream
/// order; the consumer decides when to stop pulling.
pub type NotificationRecordStream<'a> = BoxStream<'a, Result<NotificationRecord, ForgeInboxError>>;

/// Abstract upstream provider contract consumed by the sync engine and the
/// retro-apply handler. Cancellation is structural: dropping a returned
/// future or stream aborts the in-flight call, and every request carries a
/// timeout.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Notifications updated since the given cursor, oldest known first.
    fn list_notifications_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> NotificationRecordStream<'_>;

    /// Notifications strictly older than `before`, for historical
    /// backfill.
    fn list_notifications_before(
        &self,
        before: DateTime<Utc>,
        unread_only: bool,
        max_count: Option<u32>,
    ) -> NotificationRecordStream<'_>;

    async fn get_subject(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        kind: &SubjectType,
    ) -> Result<SubjectDetail, ForgeInboxError>;

    async fn list_timeline(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        per_page: u32,
        page: u32,
    ) -> Result<Timeline, ForgeInboxError>;

    /// Validates the configured token and returns the upstream login.
    async fn viewer(&self) -> Result<String, ForgeInboxError>;
}
