use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{RepoId, UserId};

/// Cached upstream repository metadata, created or refreshed on every
/// ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub user_id: UserId,
    pub upstream_id: String,
    pub full_name: String,
    pub owner_login: String,
    pub private: bool,
    pub default_branch: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Repo {
    pub fn name(&self) -> &str {
        self.full_name
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(&self.full_name)
    }
}
