use forge_inbox::query::QueryError;

pub mod notification;
pub mod query_cache;
pub mod rule;
pub mod sync;
pub mod tag;
pub mod user;
pub mod view;

fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{e}\n")?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{cause}")?;
        current = cause.source();
    }
    Ok(())
}

impl std::fmt::Debug for ForgeInboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(thiserror::Error)]
pub enum ForgeInboxError {
    #[error("Invalid input data: {user_error}")]
    InvalidInputData {
        #[source]
        source: Option<sqlx::Error>,
        user_error: String,
    },
    #[error("Invalid query: {0}")]
    InvalidQuery(#[from] QueryError),
    #[error("The entity {name} already exists")]
    AlreadyExists {
        #[source]
        source: Option<sqlx::Error>,
        name: String,
    },
    #[error("Item not found: {0}")]
    ItemNotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("No upstream token configured")]
    NoTokenConfigured,
    #[error("Upstream rate limit exhausted")]
    RateLimited { retry_after: Option<std::time::Duration> },
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] anyhow::Error),
    #[error("Unauthorized upstream access: {0}")]
    Unauthorized(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Database error: {message}")]
    DatabaseError {
        #[source]
        source: sqlx::Error,
        message: String,
    },
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ForgeInboxError {
    /// Retry classification for the job scheduler: rate exhaustion and
    /// upstream outages are worth another attempt, everything else is not
    /// unless a handler opts in.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ForgeInboxError::RateLimited { .. } | ForgeInboxError::UpstreamUnavailable(_)
        )
    }
}

#[derive(Debug, Clone)]
pub enum UpsertStatus<T: Clone> {
    Created(T),
    Updated { old: T, new: T },
    Untouched(T),
}

impl<T: Clone> UpsertStatus<T> {
    pub fn value(self) -> T {
        match self {
            UpsertStatus::Created(inner)
            | UpsertStatus::Updated { new: inner, .. }
            | UpsertStatus::Untouched(inner) => inner,
        }
    }

    pub fn value_ref(&self) -> &T {
        match self {
            UpsertStatus::Created(inner)
            | UpsertStatus::Updated { new: inner, .. }
            | UpsertStatus::Untouched(inner) => inner,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, UpsertStatus::Created(_))
    }

    pub fn is_modified(&self) -> bool {
        matches!(
            self,
            UpsertStatus::Created(_) | UpsertStatus::Updated { .. }
        )
    }
}
