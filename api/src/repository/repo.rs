use async_trait::async_trait;
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};
use url::Url;

use octotriage::{repo::Repo, RepoId};

use crate::{octotriage::OctotriageError, repository::Repository};

#[async_trait]
pub trait RepoRepository {
    async fn get_repo(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RepoId,
    ) -> Result<Option<Repo>, OctotriageError>;
    /// Idempotent on the upstream id; `full_name` and display metadata are
    /// refreshed on every notification that references the repository.
    async fn upsert_repo(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        repo: &Repo,
    ) -> Result<Repo, OctotriageError>;
}

#[async_trait]
impl RepoRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(repo_id = id.to_string()), err)]
    async fn get_repo(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RepoId,
    ) -> Result<Option<Repo>, OctotriageError> {
        let row = QueryBuilder::new(
            "SELECT id, full_name, name, private, description, owner_avatar_url FROM repository WHERE id = ",
        )
        .push_bind(id.0)
        .build_query_as::<RepoRow>()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch repository {id} from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        row.map(|repo_row| repo_row.try_into()).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(full_name = repo.full_name), err)]
    async fn upsert_repo(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        repo: &Repo,
    ) -> Result<Repo, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "INSERT INTO repository (id, full_name, name, private, description, owner_avatar_url) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(repo.id.0);
        separated.push_bind(repo.full_name.clone());
        separated.push_bind(repo.name.clone());
        separated.push_bind(repo.private);
        separated.push_bind(repo.description.clone());
        separated.push_bind(repo.owner_avatar_url.as_ref().map(Url::to_string));
        builder.push(
            r#")
                ON CONFLICT (id) DO UPDATE SET
                  full_name = excluded.full_name,
                  name = excluded.name,
                  private = excluded.private,
                  description = excluded.description,
                  owner_avatar_url = excluded.owner_avatar_url
                RETURNING id, full_name, name, private, description, owner_avatar_url
            "#,
        );

        let row = builder
            .build_query_as::<RepoRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to upsert repository {} into storage: {err}",
                    repo.full_name
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.try_into()
    }
}

#[derive(Debug)]
struct RepoRow {
    id: i64,
    full_name: String,
    name: String,
    private: bool,
    description: Option<String>,
    owner_avatar_url: Option<String>,
}

impl FromRow<'_, PgRow> for RepoRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(RepoRow {
            id: row.try_get("id")?,
            full_name: row.try_get("full_name")?,
            name: row.try_get("name")?,
            private: row.try_get("private")?,
            description: row.try_get("description")?,
            owner_avatar_url: row.try_get("owner_avatar_url")?,
        })
    }
}

impl TryFrom<RepoRow> for Repo {
    type Error = OctotriageError;

    fn try_from(row: RepoRow) -> Result<Self, Self::Error> {
        let owner_avatar_url = row
            .owner_avatar_url
            .as_deref()
            .map(|url| {
                url.parse::<Url>().map_err(|e| OctotriageError::InvalidUrlData {
                    source: e,
                    output: url.to_string(),
                })
            })
            .transpose()?;

        Ok(Repo {
            id: row.id.into(),
            full_name: row.full_name,
            name: row.name,
            private: row.private,
            description: row.description,
            owner_avatar_url,
        })
    }
}
