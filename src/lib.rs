#[macro_use]
extern crate macro_attr;

#[macro_use]
extern crate enum_derive;

use serde::{Deserialize, Serialize};

pub mod hints;
pub mod notification;
pub mod query;
pub mod repo;
pub mod rule;
pub mod sync_state;
pub mod tag;
pub mod upstream;
pub mod user;
pub mod view;

pub const DEFAULT_PAGE_SIZE: usize = 50;

/// One page of a query result together with the total number of rows the
/// query matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub rows: Vec<T>,
    pub total: i64,
}

impl<T> Page<T> {
    pub fn empty() -> Page<T> {
        Page {
            rows: vec![],
            total: 0,
        }
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub uuid::Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(uuid::Uuid::parse_str(s)?))
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(uuid: uuid::Uuid) -> Self {
                Self(uuid)
            }
        }
    };
}

uuid_id!(UserId);
uuid_id!(RepoId);
uuid_id!(TagId);
uuid_id!(RuleId);
uuid_id!(JobId);

/// Local, monotonically increasing notification identifier. Unlike every
/// other identifier this one is a 64 bit integer assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub i64);

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for NotificationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(NotificationId(s.parse()?))
    }
}

/// View identifiers are either the generated identifier of a user view or
/// one of the stable well-known built-in view identifiers (`inbox`,
/// `everything`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewId(pub String);

impl ViewId {
    pub fn new() -> Self {
        ViewId(uuid::Uuid::new_v4().to_string())
    }

    pub fn builtin(slug: &str) -> Self {
        ViewId(slug.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ViewId {
    fn default() -> Self {
        ViewId::new()
    }
}

impl std::fmt::Display for ViewId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ViewId {
    fn from(value: String) -> Self {
        ViewId(value)
    }
}
