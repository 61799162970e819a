use std::sync::Arc;

use anyhow::Context;
use sqlx::{pool::PoolConnection, Sqlite, SqlitePool, Transaction};

use crate::forge_inbox::ForgeInboxError;

pub mod job;
pub mod notification;
pub mod repo;
pub mod rule;
pub mod search;
pub mod sync_state;
pub mod tag;
pub mod user;
pub mod view;

/// Sole gateway to the local datastore. Every persisted row is owned by the
/// store; other components mutate through the typed operations the
/// per-entity repository traits expose.
#[derive(Debug)]
pub struct Repository {
    pub pool: Arc<SqlitePool>,
}

impl Repository {
    pub fn new(pool: Arc<SqlitePool>) -> Repository {
        Repository { pool }
    }

    pub async fn connect(&self) -> Result<PoolConnection<Sqlite>, ForgeInboxError> {
        Ok(self
            .pool
            .acquire()
            .await
            .context("Failed to acquire a database connection")?)
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, ForgeInboxError> {
        Ok(self
            .pool
            .begin()
            .await
            .context("Failed to begin database transaction")?)
    }
}

pub async fn commit(transaction: Transaction<'_, Sqlite>) -> Result<(), ForgeInboxError> {
    Ok(transaction
        .commit()
        .await
        .context("Failed to commit database transaction")?)
}

/// Classifies a sqlx error at the store boundary: uniqueness violations
/// become `AlreadyExists`, everything else is a `DatabaseError` carrying
/// the given message.
pub(crate) fn classify_db_error(
    err: sqlx::Error,
    unique_name: &str,
    message: String,
) -> ForgeInboxError {
    if let sqlx::Error::Database(ref db_err) = err {
        if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) {
            return ForgeInboxError::AlreadyExists {
                source: Some(err),
                name: unique_name.to_string(),
            };
        }
    }
    ForgeInboxError::DatabaseError {
        source: err,
        message,
    }
}

pub(crate) fn db_error(err: sqlx::Error, message: String) -> ForgeInboxError {
    ForgeInboxError::DatabaseError {
        source: err,
        message,
    }
}
