use async_trait::async_trait;
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::{view::View, ViewId};

use crate::{
    octotriage::OctotriageError,
    repository::{is_unique_violation, Repository},
};

#[derive(Debug, Clone, Default)]
pub struct ViewPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub query: Option<Option<String>>,
}

#[async_trait]
pub trait ViewRepository {
    async fn list_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<View>, OctotriageError>;
    async fn get_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
    ) -> Result<Option<View>, OctotriageError>;
    async fn create_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        slug: &str,
        query: Option<String>,
    ) -> Result<View, OctotriageError>;
    async fn update_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
        patch: &ViewPatch,
    ) -> Result<View, OctotriageError>;
    /// System views are refused with `Forbidden` before this is reached; the
    /// statement still guards against deleting them.
    async fn delete_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
    ) -> Result<(), OctotriageError>;
    async fn reorder_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[ViewId],
    ) -> Result<(), OctotriageError>;
}

const VIEW_COLUMNS: &str = "id, name, slug, query, display_order, system_view";

#[async_trait]
impl ViewRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn list_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<View>, OctotriageError> {
        let rows = QueryBuilder::new(format!(
            "SELECT {VIEW_COLUMNS} FROM view ORDER BY display_order, id"
        ))
        .build_query_as::<ViewRow>()
        .fetch_all(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch views from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        Ok(rows.into_iter().map(View::from).collect())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = id.to_string()), err)]
    async fn get_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
    ) -> Result<Option<View>, OctotriageError> {
        let row = QueryBuilder::new(format!("SELECT {VIEW_COLUMNS} FROM view WHERE id = "))
            .push_bind(id.0)
            .build_query_as::<ViewRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch view {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(row.map(View::from))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = name), err)]
    async fn create_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        slug: &str,
        query: Option<String>,
    ) -> Result<View, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "INSERT INTO view (name, slug, query, display_order, system_view) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(name);
        separated.push_bind(slug);
        separated.push_bind(query);
        builder
            .push(", (SELECT COALESCE(MAX(display_order), 0) + 1 FROM view), FALSE)")
            .push(format!(" RETURNING {VIEW_COLUMNS}"));

        let row = builder
            .build_query_as::<ViewRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "view",
                        name: name.to_string(),
                    }
                } else {
                    let message = format!("Failed to insert view `{name}` into storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        Ok(row.into())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = id.to_string()), err)]
    async fn update_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
        patch: &ViewPatch,
    ) -> Result<View, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE view SET ");
        let mut separated = builder.separated(", ");
        if let Some(name) = &patch.name {
            separated.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(slug) = &patch.slug {
            separated.push("slug = ").push_bind_unseparated(slug.clone());
        }
        if let Some(query) = &patch.query {
            separated.push("query = ").push_bind_unseparated(query.clone());
        }
        builder.push(" WHERE id = ").push_bind(id.0);
        builder.push(format!(" RETURNING {VIEW_COLUMNS}"));

        let row = builder
            .build_query_as::<ViewRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "view",
                        name: patch.name.clone().unwrap_or_default(),
                    }
                } else {
                    let message = format!("Failed to update view {id} in storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        row.map(View::from)
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("view {id}")))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(view_id = id.to_string()), err)]
    async fn delete_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: ViewId,
    ) -> Result<(), OctotriageError> {
        let result = QueryBuilder::new("DELETE FROM view WHERE id = ")
            .push_bind(id.0)
            .push(" AND system_view = FALSE")
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete view {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        if result.rows_affected() == 0 {
            return Err(OctotriageError::ItemNotFound(format!("view {id}")));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[ViewId],
    ) -> Result<(), OctotriageError> {
        let ids: Vec<i64> = ordered_ids.iter().map(|id| id.0).collect();
        let orders: Vec<i32> = (1..=ids.len() as i32).collect();

        QueryBuilder::new("UPDATE view SET display_order = ord.display_order FROM unnest(")
            .push_bind(ids)
            .push(", ")
            .push_bind(orders)
            .push(") AS ord(id, display_order) WHERE view.id = ord.id")
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to reorder views in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(())
    }
}

#[derive(Debug)]
struct ViewRow {
    id: i64,
    name: String,
    slug: String,
    query: Option<String>,
    display_order: i32,
    system_view: bool,
}

impl FromRow<'_, PgRow> for ViewRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(ViewRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            query: row.try_get("query")?,
            display_order: row.try_get("display_order")?,
            system_view: row.try_get("system_view")?,
        })
    }
}

impl From<ViewRow> for View {
    fn from(row: ViewRow) -> Self {
        View {
            id: row.id.into(),
            name: row.name,
            slug: row.slug,
            query: row.query,
            display_order: row.display_order,
            system_view: row.system_view,
        }
    }
}
