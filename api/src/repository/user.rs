use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, Secret};
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::user::{PasswordHash, SyncSettings, User};

use crate::{octotriage::OctotriageError, repository::Repository};

#[async_trait]
pub trait UserRepository {
    /// The singleton principal, if bootstrap already ran.
    async fn get_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<User>, OctotriageError>;
    async fn create_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        username: &str,
        password_hash: Secret<PasswordHash>,
        sync_settings: &SyncSettings,
    ) -> Result<User, OctotriageError>;
    async fn update_user_credentials(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        username: &str,
        password_hash: Secret<PasswordHash>,
    ) -> Result<User, OctotriageError>;
    async fn update_sync_settings(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        sync_settings: &SyncSettings,
    ) -> Result<User, OctotriageError>;
}

const USER_COLUMNS: &str = "id, username, password_hash, sync_settings, created_at, updated_at";

#[async_trait]
impl UserRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn get_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Option<User>, OctotriageError> {
        let row = QueryBuilder::new(format!(
            "SELECT {USER_COLUMNS} FROM app_user ORDER BY id LIMIT 1"
        ))
        .build_query_as::<UserRow>()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch user from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        row.map(User::try_from).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(username = username), err)]
    async fn create_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        username: &str,
        password_hash: Secret<PasswordHash>,
        sync_settings: &SyncSettings,
    ) -> Result<User, OctotriageError> {
        let sync_settings_json = serde_json::to_value(sync_settings)
            .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                "Failed to serialize sync settings: {err}"
            )))?;

        let mut builder = QueryBuilder::new(
            "INSERT INTO app_user (username, password_hash, sync_settings) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(username);
        separated.push_bind(password_hash.expose_secret().0.clone());
        separated.push_bind(sync_settings_json);
        builder.push(format!(") RETURNING {USER_COLUMNS}"));

        let row = builder
            .build_query_as::<UserRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to insert user `{username}` into storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(username = username), err)]
    async fn update_user_credentials(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        username: &str,
        password_hash: Secret<PasswordHash>,
    ) -> Result<User, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE app_user SET username = ");
        builder.push_bind(username);
        builder.push(", password_hash = ");
        builder.push_bind(password_hash.expose_secret().0.clone());
        builder.push(", updated_at = now()");
        builder.push(format!(" RETURNING {USER_COLUMNS}"));

        let row = builder
            .build_query_as::<UserRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update user credentials in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.ok_or_else(|| OctotriageError::ItemNotFound("user".to_string()))?
            .try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn update_sync_settings(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        sync_settings: &SyncSettings,
    ) -> Result<User, OctotriageError> {
        let sync_settings_json = serde_json::to_value(sync_settings)
            .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                "Failed to serialize sync settings: {err}"
            )))?;

        let mut builder = QueryBuilder::new("UPDATE app_user SET sync_settings = ");
        builder.push_bind(sync_settings_json);
        builder.push(", updated_at = now()");
        builder.push(format!(" RETURNING {USER_COLUMNS}"));

        let row = builder
            .build_query_as::<UserRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to update sync settings in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.ok_or_else(|| OctotriageError::ItemNotFound("user".to_string()))?
            .try_into()
    }
}

#[derive(Debug)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    sync_settings: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for UserRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(UserRow {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password_hash: row.try_get("password_hash")?,
            sync_settings: row.try_get("sync_settings")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<UserRow> for User {
    type Error = OctotriageError;

    fn try_from(row: UserRow) -> Result<Self, Self::Error> {
        let sync_settings: SyncSettings = serde_json::from_value(row.sync_settings.clone())
            .map_err(|err| {
                OctotriageError::from_json_serde_error(err, row.sync_settings.to_string())
            })?;

        Ok(User {
            id: row.id.into(),
            username: row.username,
            password_hash: Secret::new(PasswordHash(row.password_hash)),
            sync_settings,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
