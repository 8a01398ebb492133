use async_trait::async_trait;
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::{tag::Tag, TagId};

use crate::{
    octotriage::OctotriageError,
    repository::{is_unique_violation, Repository},
};

#[derive(Debug, Clone, Default)]
pub struct TagPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub color: Option<Option<String>>,
    pub description: Option<Option<String>>,
}

#[async_trait]
pub trait TagRepository {
    async fn list_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<Tag>, OctotriageError>;
    async fn get_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
    ) -> Result<Option<Tag>, OctotriageError>;
    async fn create_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        slug: &str,
        color: Option<String>,
        description: Option<String>,
    ) -> Result<Tag, OctotriageError>;
    async fn update_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
        patch: &TagPatch,
    ) -> Result<Tag, OctotriageError>;
    /// Deletes the tag, its assignments, and scrubs it from every
    /// denormalized `tag_ids` array in one round-trip each.
    async fn delete_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
    ) -> Result<(), OctotriageError>;
    async fn reorder_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[TagId],
    ) -> Result<(), OctotriageError>;
    /// `Ok(false)` when the triple was already assigned.
    async fn assign_tag_to_entity(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<bool, OctotriageError>;
    /// `Ok(false)` when there was nothing to remove.
    async fn remove_tag_assignment(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<bool, OctotriageError>;
}

const TAG_COLUMNS: &str = "id, name, slug, color, description, display_order";

#[async_trait]
impl TagRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, err)]
    async fn list_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<Tag>, OctotriageError> {
        let rows = QueryBuilder::new(format!(
            "SELECT {TAG_COLUMNS} FROM tag ORDER BY display_order, id"
        ))
        .build_query_as::<TagRow>()
        .fetch_all(&mut **executor)
        .await
        .map_err(|err| {
            let message = format!("Failed to fetch tags from storage: {err}");
            OctotriageError::DatabaseError { source: err, message }
        })?;

        Ok(rows.into_iter().map(Tag::from).collect())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = id.to_string()), err)]
    async fn get_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
    ) -> Result<Option<Tag>, OctotriageError> {
        let row = QueryBuilder::new(format!("SELECT {TAG_COLUMNS} FROM tag WHERE id = "))
            .push_bind(id.0)
            .build_query_as::<TagRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch tag {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(row.map(Tag::from))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = name), err)]
    async fn create_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        slug: &str,
        color: Option<String>,
        description: Option<String>,
    ) -> Result<Tag, OctotriageError> {
        let mut builder = QueryBuilder::new(
            "INSERT INTO tag (name, slug, color, description, display_order) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(name);
        separated.push_bind(slug);
        separated.push_bind(color);
        separated.push_bind(description);
        builder
            .push(", (SELECT COALESCE(MAX(display_order), 0) + 1 FROM tag))")
            .push(format!(" RETURNING {TAG_COLUMNS}"));

        let row = builder
            .build_query_as::<TagRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "tag",
                        name: name.to_string(),
                    }
                } else {
                    let message = format!("Failed to insert tag `{name}` into storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        Ok(row.into())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = id.to_string()), err)]
    async fn update_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
        patch: &TagPatch,
    ) -> Result<Tag, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE tag SET ");
        let mut separated = builder.separated(", ");
        if let Some(name) = &patch.name {
            separated.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(slug) = &patch.slug {
            separated.push("slug = ").push_bind_unseparated(slug.clone());
        }
        if let Some(color) = &patch.color {
            separated.push("color = ").push_bind_unseparated(color.clone());
        }
        if let Some(description) = &patch.description {
            separated
                .push("description = ")
                .push_bind_unseparated(description.clone());
        }
        builder.push(" WHERE id = ").push_bind(id.0);
        builder.push(format!(" RETURNING {TAG_COLUMNS}"));

        let row = builder
            .build_query_as::<TagRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "tag",
                        name: patch.name.clone().unwrap_or_default(),
                    }
                } else {
                    let message = format!("Failed to update tag {id} in storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        row.map(Tag::from)
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("tag {id}")))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(tag_id = id.to_string()), err)]
    async fn delete_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: TagId,
    ) -> Result<(), OctotriageError> {
        let result = QueryBuilder::new("DELETE FROM tag WHERE id = ")
            .push_bind(id.0)
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete tag {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        if result.rows_affected() == 0 {
            return Err(OctotriageError::ItemNotFound(format!("tag {id}")));
        }

        // Assignments go with the tag (FK cascade); scrub the denormalized
        // arrays in a single statement.
        QueryBuilder::new("UPDATE notification SET tag_ids = array_remove(tag_ids, ")
            .push_bind(id.0)
            .push(") WHERE ")
            .push_bind(id.0)
            .push(" = ANY(tag_ids)")
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to scrub tag {id} from notifications: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[TagId],
    ) -> Result<(), OctotriageError> {
        let ids: Vec<i64> = ordered_ids.iter().map(|id| id.0).collect();
        let orders: Vec<i32> = (1..=ids.len() as i32).collect();

        QueryBuilder::new("UPDATE tag SET display_order = ord.display_order FROM unnest(")
            .push_bind(ids)
            .push(", ")
            .push_bind(orders)
            .push(") AS ord(id, display_order) WHERE tag.id = ord.id")
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to reorder tags in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(())
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(tag_id = tag_id.to_string(), entity_type = entity_type, entity_id = entity_id),
        err
    )]
    async fn assign_tag_to_entity(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<bool, OctotriageError> {
        // The UNIQUE(tag_id, entity_type, entity_id) constraint makes
        // concurrent assignment safe; a conflict means "already assigned".
        let mut builder =
            QueryBuilder::new("INSERT INTO tag_assignment (tag_id, entity_type, entity_id) VALUES (");
        let mut separated = builder.separated(", ");
        separated.push_bind(tag_id.0);
        separated.push_bind(entity_type);
        separated.push_bind(entity_id);
        builder.push(") ON CONFLICT (tag_id, entity_type, entity_id) DO NOTHING");

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to assign tag {tag_id} to {entity_type} {entity_id}: {err}"
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(tag_id = tag_id.to_string(), entity_type = entity_type, entity_id = entity_id),
        err
    )]
    async fn remove_tag_assignment(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity_type: &str,
        entity_id: i64,
    ) -> Result<bool, OctotriageError> {
        let mut builder = QueryBuilder::new("DELETE FROM tag_assignment WHERE tag_id = ");
        builder.push_bind(tag_id.0);
        builder.push(" AND entity_type = ").push_bind(entity_type);
        builder.push(" AND entity_id = ").push_bind(entity_id);

        let result = builder
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!(
                    "Failed to remove tag {tag_id} from {entity_type} {entity_id}: {err}"
                );
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug)]
struct TagRow {
    id: i64,
    name: String,
    slug: String,
    color: Option<String>,
    description: Option<String>,
    display_order: i32,
}

impl FromRow<'_, PgRow> for TagRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(TagRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
            color: row.try_get("color")?,
            description: row.try_get("description")?,
            display_order: row.try_get("display_order")?,
        })
    }
}

impl From<TagRow> for Tag {
    fn from(row: TagRow) -> Self {
        Tag {
            id: row.id.into(),
            name: row.name,
            slug: row.slug,
            color: row.color,
            description: row.description,
            display_order: row.display_order,
        }
    }
}
