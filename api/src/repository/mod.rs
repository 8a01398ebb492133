use std::sync::Arc;

use anyhow::Context;
use sqlx::{pool::PoolConnection, PgPool, Postgres, Transaction};

use crate::octotriage::OctotriageError;

pub mod notification;
pub mod pull_request;
pub mod repo;
pub mod rule;
pub mod sync_state;
pub mod tag;
pub mod user;
pub mod view;

/// The single boundary to persistent state. Every operation lives on one of
/// the per-entity traits implemented on this struct and takes an explicit
/// transaction.
#[derive(Debug)]
pub struct Repository {
    pub pool: Arc<PgPool>,
}

impl Repository {
    pub fn new(pool: Arc<PgPool>) -> Repository {
        Repository { pool }
    }

    pub async fn connect(&self) -> Result<PoolConnection<Postgres>, OctotriageError> {
        Ok(self
            .pool
            .acquire()
            .await
            .context("Failed to connect to the database")?)
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        Ok(self
            .pool
            .begin()
            .await
            .context("Failed to begin database transaction")?)
    }
}

/// Postgres unique-constraint violations are a distinguished error kind:
/// tag/rule/view creation surfaces them as a conflict and bulk tag assignment
/// coalesces them into "already assigned".
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db_error| db_error.code().map(|code| code.to_string()))
        .map(|code| code == "23505")
        .unwrap_or(false)
}
