use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};
use url::Url;

use octotriage::{
    notification::{Notification, NotificationPollItem, NotificationStateChange, SubjectType},
    NotificationId, Page, PullRequestId, RepoId, TagId,
};

use crate::{
    octotriage::{OctotriageError, UpsertStatus},
    repository::Repository,
    search::{CompiledQuery, QueryArg, SqlPiece},
};

/// Input of the ingestion upsert, idempotent on `github_id`.
#[derive(Debug, Clone)]
pub struct NotificationUpsert {
    pub github_id: String,
    pub repository_id: RepoId,
    pub pull_request_id: Option<PullRequestId>,
    pub title: String,
    pub subject_type: SubjectType,
    pub subject_url: Option<Url>,
    pub subject_raw: Option<serde_json::Value>,
    pub reason: String,
    pub author_login: Option<String>,
    pub author_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub unread: bool,
}

#[async_trait]
pub trait NotificationRepository {
    async fn get_notification_for_github_id(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<Option<Notification>, OctotriageError>;
    async fn list_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
    ) -> Result<Page<Notification>, OctotriageError>;
    async fn list_notifications_for_poll(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
    ) -> Result<Vec<NotificationPollItem>, OctotriageError>;
    async fn notification_matches_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        notification_id: NotificationId,
    ) -> Result<bool, OctotriageError>;
    async fn create_or_update_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        notification: Box<NotificationUpsert>,
    ) -> Result<UpsertStatus<Box<Notification>>, OctotriageError>;
    async fn set_notification_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        change: NotificationStateChange,
    ) -> Result<Notification, OctotriageError>;
    async fn snooze_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        snoozed_until: DateTime<Utc>,
    ) -> Result<Notification, OctotriageError>;
    async fn set_notifications_state_by_github_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_ids: &[String],
        change: NotificationStateChange,
    ) -> Result<u64, OctotriageError>;
    async fn set_notifications_state_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        change: NotificationStateChange,
    ) -> Result<u64, OctotriageError>;
    async fn snooze_notifications_by_github_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_ids: &[String],
        snoozed_until: DateTime<Utc>,
    ) -> Result<u64, OctotriageError>;
    async fn snooze_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        snoozed_until: DateTime<Utc>,
    ) -> Result<u64, OctotriageError>;
    async fn update_notification_tag_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        notification_id: NotificationId,
    ) -> Result<Vec<TagId>, OctotriageError>;
}

const NOTIFICATION_COLUMNS: &str = r#"
    n.id,
    n.github_id,
    n.repository_id,
    n.pull_request_id,
    n.title,
    n.subject_type,
    n.subject_url,
    n.subject_raw,
    n.reason,
    n.author_login,
    n.author_id,
    n.updated_at,
    n.last_read_at,
    n.snoozed_until,
    n.effective_sort_date,
    n.unread,
    n.archived,
    n.muted,
    n.starred,
    n.filtered,
    n.tag_ids
"#;

/// Append the compiled conditions of a query, binding its arguments in
/// order. The surrounding statement must already have aliased the
/// notification table as `n` and joined `repository` as `r`.
fn push_compiled_conditions(builder: &mut QueryBuilder<'_, Postgres>, query: &CompiledQuery) {
    for (i, condition) in query.conditions.iter().enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        builder.push("(");
        for piece in &condition.0 {
            match piece {
                SqlPiece::Sql(sql) => {
                    builder.push(sql.as_str());
                }
                SqlPiece::Bind(QueryArg::Text(value)) => {
                    builder.push_bind(value.clone());
                }
                SqlPiece::Bind(QueryArg::Bool(value)) => {
                    builder.push_bind(*value);
                }
                SqlPiece::Bind(QueryArg::Time(value)) => {
                    builder.push_bind(*value);
                }
            }
        }
        builder.push(")");
    }
}

fn state_change_set_clause(change: NotificationStateChange) -> &'static str {
    match change {
        NotificationStateChange::MarkRead => "unread = FALSE, last_read_at = now()",
        NotificationStateChange::MarkUnread => "unread = TRUE",
        NotificationStateChange::Archive => "archived = TRUE",
        NotificationStateChange::Unarchive => "archived = FALSE",
        NotificationStateChange::Mute => "muted = TRUE",
        NotificationStateChange::Unmute => "muted = FALSE",
        NotificationStateChange::Star => "starred = TRUE",
        NotificationStateChange::Unstar => "starred = FALSE",
        NotificationStateChange::MarkFiltered => "filtered = TRUE",
        NotificationStateChange::MarkUnfiltered => "filtered = FALSE",
        NotificationStateChange::Unsnooze => "snoozed_until = NULL",
    }
}

#[async_trait]
impl NotificationRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(github_id = github_id), err)]
    async fn get_notification_for_github_id(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<Option<Notification>, OctotriageError> {
        let row = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification n WHERE n.github_id = "
        ))
        .push_bind(github_id)
        .build_query_as::<NotificationRow>()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch notification {github_id} from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        row.map(|notification_row| notification_row.try_into())
            .transpose()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(query = query.text, limit = query.limit, offset = query.offset),
        err
    )]
    async fn list_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
    ) -> Result<Page<Notification>, OctotriageError> {
        let mut count_builder = QueryBuilder::new(
            "SELECT count(*) FROM notification n JOIN repository r ON r.id = n.repository_id WHERE ",
        );
        push_compiled_conditions(&mut count_builder, query);
        let count: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to count notifications from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        let mut builder = QueryBuilder::new(format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notification n JOIN repository r ON r.id = n.repository_id WHERE "
        ));
        push_compiled_conditions(&mut builder, query);
        builder.push(format!(" ORDER BY {} ", query.order_by));
        builder.push(" LIMIT ").push_bind(query.limit as i64);
        builder.push(" OFFSET ").push_bind(query.offset as i64);

        let rows = builder
            .build_query_as::<NotificationRow>()
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch notifications from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        let content = rows
            .iter()
            .map(|row| row.try_into())
            .collect::<Result<Vec<Notification>, OctotriageError>>()?;

        Ok(Page {
            total: count.try_into().unwrap_or(0),
            limit: query.limit,
            offset: query.offset,
            content,
        })
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn list_notifications_for_poll(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
    ) -> Result<Vec<NotificationPollItem>, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "SELECT n.github_id, n.effective_sort_date FROM notification n JOIN repository r ON r.id = n.repository_id WHERE ",
        );
        push_compiled_conditions(&mut builder, query);
        builder.push(format!(" ORDER BY {} ", query.order_by));
        builder.push(" LIMIT ").push_bind(query.limit as i64);

        let rows = builder
            .build()
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch poll listing from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        rows.into_iter()
            .map(|row| {
                Ok(NotificationPollItem {
                    github_id: row.try_get("github_id").map_err(unexpected_row_error)?,
                    effective_sort_date: row
                        .try_get("effective_sort_date")
                        .map_err(unexpected_row_error)?,
                })
            })
            .collect()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(query = query.text, notification_id = notification_id.to_string()),
        err
    )]
    async fn notification_matches_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        notification_id: NotificationId,
    ) -> Result<bool, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "SELECT count(*) FROM notification n JOIN repository r ON r.id = n.repository_id WHERE ",
        );
        push_compiled_conditions(&mut builder, query);
        builder.push(" AND n.id = ").push_bind(notification_id.0);

        let count: i64 = builder
            .build_query_scalar()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to test notification {notification_id} against query: {err}"
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(count > 0)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(github_id = notification.github_id),
        err
    )]
    async fn create_or_update_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        notification: Box<NotificationUpsert>,
    ) -> Result<UpsertStatus<Box<Notification>>, OctotriageError> {
        // Single-statement upsert: concurrent re-deliveries of the same
        // thread cannot both observe `was_new_insert`. The `xmax = 0` check
        // distinguishes a fresh insert from a conflict-update.
        let mut builder = QueryBuilder::new(
            r#"
                INSERT INTO notification
                  (
                    github_id,
                    repository_id,
                    pull_request_id,
                    title,
                    subject_type,
                    subject_url,
                    subject_raw,
                    reason,
                    author_login,
                    author_id,
                    updated_at,
                    last_read_at,
                    effective_sort_date,
                    unread
                  )
                VALUES (
            "#,
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(notification.github_id.clone());
        separated.push_bind(notification.repository_id.0);
        separated.push_bind(notification.pull_request_id.map(|id| id.0));
        separated.push_bind(notification.title.clone());
        separated.push_bind(notification.subject_type.to_string());
        separated.push_bind(notification.subject_url.as_ref().map(Url::to_string));
        separated.push_bind(notification.subject_raw.clone());
        separated.push_bind(notification.reason.clone());
        separated.push_bind(notification.author_login.clone());
        separated.push_bind(notification.author_id);
        separated.push_bind(notification.updated_at);
        separated.push_bind(notification.last_read_at);
        separated.push_bind(notification.updated_at);
        separated.push_bind(notification.unread);
        builder.push(
            r#")
                ON CONFLICT (github_id) DO UPDATE SET
                  title = excluded.title,
                  subject_type = excluded.subject_type,
                  subject_url = excluded.subject_url,
                  subject_raw = excluded.subject_raw,
                  reason = excluded.reason,
                  author_login = excluded.author_login,
                  author_id = excluded.author_id,
                  updated_at = excluded.updated_at,
                  last_read_at = excluded.last_read_at,
                  effective_sort_date = excluded.effective_sort_date,
                  unread = excluded.unread,
                  pull_request_id = COALESCE(excluded.pull_request_id, notification.pull_request_id)
            "#,
        );
        builder.push(format!(
            " RETURNING {}, (xmax = 0) AS was_new_insert",
            NOTIFICATION_COLUMNS.replace("n.", "notification.")
        ));

        let row = builder
            .build()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to upsert notification {} into storage: {err}",
                    notification.github_id
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        let was_new_insert: bool = row.try_get("was_new_insert").map_err(unexpected_row_error)?;
        let notification_row = NotificationRow::from_row(&row).map_err(unexpected_row_error)?;
        let stored: Notification = (&notification_row).try_into()?;

        Ok(if was_new_insert {
            UpsertStatus::Created(Box::new(stored))
        } else {
            UpsertStatus::Updated(Box::new(stored))
        })
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(github_id = github_id, change = ?change),
        err
    )]
    async fn set_notification_state(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        change: NotificationStateChange,
    ) -> Result<Notification, OctotriageError> {
        let mut builder = QueryBuilder::new(format!(
            "UPDATE notification SET {} WHERE github_id = ",
            state_change_set_clause(change)
        ));
        builder.push_bind(github_id);
        builder.push(format!(
            " RETURNING {}",
            NOTIFICATION_COLUMNS.replace("n.", "notification.")
        ));

        let row = builder
            .build_query_as::<NotificationRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message =
                    format!("Failed to update notification {github_id} in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?
            .try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(github_id = github_id), err)]
    async fn snooze_notification(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        snoozed_until: DateTime<Utc>,
    ) -> Result<Notification, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE notification SET snoozed_until = ");
        builder.push_bind(snoozed_until);
        builder.push(" WHERE github_id = ").push_bind(github_id);
        builder.push(format!(
            " RETURNING {}",
            NOTIFICATION_COLUMNS.replace("n.", "notification.")
        ));

        let row = builder
            .build_query_as::<NotificationRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message =
                    format!("Failed to snooze notification {github_id} in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?
            .try_into()
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(count = github_ids.len(), change = ?change),
        err
    )]
    async fn set_notifications_state_by_github_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_ids: &[String],
        change: NotificationStateChange,
    ) -> Result<u64, OctotriageError> {
        if github_ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new(format!(
            "UPDATE notification SET {} WHERE github_id = ANY(",
            state_change_set_clause(change)
        ));
        builder.push_bind(github_ids.to_vec());
        builder.push(")");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to bulk-update notifications in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(query = query.text, change = ?change),
        err
    )]
    async fn set_notifications_state_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        change: NotificationStateChange,
    ) -> Result<u64, OctotriageError> {
        // Single statement per bulk: the matching set is resolved inside the
        // update itself, no read-modify-write loop.
        let mut builder = QueryBuilder::new(format!(
            "UPDATE notification SET {} WHERE id IN (SELECT n.id FROM notification n JOIN repository r ON r.id = n.repository_id WHERE ",
            state_change_set_clause(change)
        ));
        push_compiled_conditions(&mut builder, query);
        builder.push(")");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message =
                    format!("Failed to bulk-update notifications from query in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = github_ids.len()), err)]
    async fn snooze_notifications_by_github_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_ids: &[String],
        snoozed_until: DateTime<Utc>,
    ) -> Result<u64, OctotriageError> {
        if github_ids.is_empty() {
            return Ok(0);
        }
        let mut builder = QueryBuilder::new("UPDATE notification SET snoozed_until = ");
        builder.push_bind(snoozed_until);
        builder.push(" WHERE github_id = ANY(");
        builder.push_bind(github_ids.to_vec());
        builder.push(")");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to bulk-snooze notifications in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(query = query.text), err)]
    async fn snooze_notifications_from_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &CompiledQuery,
        snoozed_until: DateTime<Utc>,
    ) -> Result<u64, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE notification SET snoozed_until = ");
        builder.push_bind(snoozed_until);
        builder.push(" WHERE id IN (SELECT n.id FROM notification n JOIN repository r ON r.id = n.repository_id WHERE ");
        push_compiled_conditions(&mut builder, query);
        builder.push(")");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message =
                    format!("Failed to bulk-snooze notifications from query in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected())
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(notification_id = notification_id.to_string()),
        err
    )]
    async fn update_notification_tag_ids(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        notification_id: NotificationId,
    ) -> Result<Vec<TagId>, OctotriageError> {
        // Recompute the denormalized array from the authoritative join table.
        let row = QueryBuilder::new(
            r#"
                UPDATE notification SET tag_ids = COALESCE(
                  (
                    SELECT array_agg(ta.tag_id ORDER BY ta.tag_id)
                    FROM tag_assignment ta
                    WHERE ta.entity_type = 'notification' AND ta.entity_id = notification.id
                  ),
                  '{}'
                )
                WHERE id =
            "#,
        )
        .push_bind(notification_id.0)
        .push(" RETURNING tag_ids")
        .build()
        .fetch_optional(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!(
                "Failed to recompute tag_ids for notification {notification_id}: {err}"
            );
            OctotriageError::DatabaseError { source: err, message }
        })?;

        let row = row.ok_or_else(|| {
            OctotriageError::ItemNotFound(format!("notification {notification_id}"))
        })?;
        let tag_ids: Vec<i64> = row.try_get("tag_ids").map_err(unexpected_row_error)?;
        Ok(tag_ids.into_iter().map(TagId).collect())
    }
}

fn unexpected_row_error(err: sqlx::Error) -> OctotriageError {
    OctotriageError::Unexpected(anyhow::anyhow!("Failed to decode notification row: {err}"))
}

#[derive(Debug)]
struct NotificationRow {
    id: i64,
    github_id: String,
    repository_id: i64,
    pull_request_id: Option<i64>,
    title: String,
    subject_type: String,
    subject_url: Option<String>,
    subject_raw: Option<serde_json::Value>,
    reason: String,
    author_login: Option<String>,
    author_id: Option<i64>,
    updated_at: DateTime<Utc>,
    last_read_at: Option<DateTime<Utc>>,
    snoozed_until: Option<DateTime<Utc>>,
    effective_sort_date: DateTime<Utc>,
    unread: bool,
    archived: bool,
    muted: bool,
    starred: bool,
    filtered: bool,
    tag_ids: Vec<i64>,
}

impl FromRow<'_, PgRow> for NotificationRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(NotificationRow {
            id: row.try_get("id")?,
            github_id: row.try_get("github_id")?,
            repository_id: row.try_get("repository_id")?,
            pull_request_id: row.try_get("pull_request_id")?,
            title: row.try_get("title")?,
            subject_type: row.try_get("subject_type")?,
            subject_url: row.try_get("subject_url")?,
            subject_raw: row.try_get("subject_raw")?,
            reason: row.try_get("reason")?,
            author_login: row.try_get("author_login")?,
            author_id: row.try_get("author_id")?,
            updated_at: row.try_get("updated_at")?,
            last_read_at: row.try_get("last_read_at")?,
            snoozed_until: row.try_get("snoozed_until")?,
            effective_sort_date: row.try_get("effective_sort_date")?,
            unread: row.try_get("unread")?,
            archived: row.try_get("archived")?,
            muted: row.try_get("muted")?,
            starred: row.try_get("starred")?,
            filtered: row.try_get("filtered")?,
            tag_ids: row.try_get("tag_ids")?,
        })
    }
}

impl TryFrom<NotificationRow> for Notification {
    type Error = OctotriageError;

    fn try_from(row: NotificationRow) -> Result<Self, Self::Error> {
        (&row).try_into()
    }
}

impl TryFrom<&NotificationRow> for Notification {
    type Error = OctotriageError;

    fn try_from(row: &NotificationRow) -> Result<Self, Self::Error> {
        let subject_type: SubjectType =
            row.subject_type
                .parse()
                .map_err(|e| OctotriageError::InvalidEnumData {
                    source: e,
                    output: row.subject_type.clone(),
                })?;
        let subject_url = row
            .subject_url
            .as_deref()
            .map(|url| {
                url.parse::<Url>().map_err(|e| OctotriageError::InvalidUrlData {
                    source: e,
                    output: url.to_string(),
                })
            })
            .transpose()?;

        Ok(Notification {
            id: row.id.into(),
            github_id: row.github_id.clone(),
            repository_id: row.repository_id.into(),
            pull_request_id: row.pull_request_id.map(Into::into),
            title: row.title.clone(),
            subject_type,
            subject_url,
            subject_raw: row.subject_raw.clone(),
            reason: row.reason.clone(),
            author_login: row.author_login.clone(),
            author_id: row.author_id,
            updated_at: row.updated_at,
            last_read_at: row.last_read_at,
            snoozed_until: row.snoozed_until,
            effective_sort_date: row.effective_sort_date,
            unread: row.unread,
            archived: row.archived,
            muted: row.muted,
            starred: row.starred,
            filtered: row.filtered,
            tag_ids: row.tag_ids.iter().copied().map(TagId).collect(),
        })
    }
}
