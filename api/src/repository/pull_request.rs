use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::{pull_request::PullRequest, PullRequestId, RepoId};

use crate::{octotriage::OctotriageError, repository::Repository};

/// Fields extracted from the raw subject payload when upserting a pull
/// request snapshot.
#[derive(Debug, Clone)]
pub struct PullRequestUpsert {
    pub repository_id: RepoId,
    pub number: i64,
    pub state: String,
    pub merged: bool,
    pub mergeable: Option<bool>,
    pub draft: bool,
    pub raw_data: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait PullRequestRepository {
    async fn get_pull_request(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: PullRequestId,
    ) -> Result<Option<PullRequest>, OctotriageError>;
    async fn upsert_pull_request(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        pull_request: &PullRequestUpsert,
    ) -> Result<PullRequest, OctotriageError>;
}

#[async_trait]
impl PullRequestRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(pull_request_id = id.to_string()), err)]
    async fn get_pull_request(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: PullRequestId,
    ) -> Result<Option<PullRequest>, OctotriageError> {
        let row = QueryBuilder::new(
            "SELECT id, repository_id, number, state, merged, mergeable, draft, raw_data, updated_at FROM pull_request WHERE id = ",
        )
        .push_bind(id.0)
        .build_query_as::<PullRequestRow>()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch pull request {id} from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        Ok(row.map(PullRequest::from))
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(repository_id = pull_request.repository_id.to_string(), number = pull_request.number),
        err
    )]
    async fn upsert_pull_request(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        pull_request: &PullRequestUpsert,
    ) -> Result<PullRequest, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "INSERT INTO pull_request (repository_id, number, state, merged, mergeable, draft, raw_data, updated_at) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(pull_request.repository_id.0);
        separated.push_bind(pull_request.number);
        separated.push_bind(pull_request.state.clone());
        separated.push_bind(pull_request.merged);
        separated.push_bind(pull_request.mergeable);
        separated.push_bind(pull_request.draft);
        separated.push_bind(pull_request.raw_data.clone());
        separated.push_bind(pull_request.updated_at);
        builder.push(
            r#")
                ON CONFLICT (repository_id, number) DO UPDATE SET
                  state = excluded.state,
                  merged = excluded.merged,
                  mergeable = excluded.mergeable,
                  draft = excluded.draft,
                  raw_data = excluded.raw_data,
                  updated_at = excluded.updated_at
                RETURNING id, repository_id, number, state, merged, mergeable, draft, raw_data, updated_at
            "#,
        );

        let row = builder
            .build_query_as::<PullRequestRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to upsert pull request {}#{} into storage: {err}",
                    pull_request.repository_id, pull_request.number
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(row.into())
    }
}

#[derive(Debug)]
struct PullRequestRow {
    id: i64,
    repository_id: i64,
    number: i64,
    state: String,
    merged: bool,
    mergeable: Option<bool>,
    draft: bool,
    raw_data: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for PullRequestRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(PullRequestRow {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            number: row.try_get("number")?,
            state: row.try_get("state")?,
            merged: row.try_get("merged")?,
            mergeable: row.try_get("mergeable")?,
            draft: row.try_get("draft")?,
            raw_data: row.try_get("raw_data")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl From<PullRequestRow> for PullRequest {
    fn from(row: PullRequestRow) -> Self {
        PullRequest {
            id: row.id.into(),
            repository_id: row.repository_id.into(),
            number: row.number,
            state: row.state,
            merged: row.merged,
            mergeable: row.mergeable,
            draft: row.draft,
            raw_data: row.raw_data,
            updated_at: row.updated_at,
        }
    }
}
