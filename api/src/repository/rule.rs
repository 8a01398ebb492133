use async_trait::async_trait;
use sqlx::{postgres::PgRow, FromRow, Postgres, QueryBuilder, Row, Transaction};

use octotriage::{
    rule::{Rule, RuleActions},
    RuleId, ViewId,
};

use crate::{
    octotriage::OctotriageError,
    repository::{is_unique_violation, Repository},
};

#[derive(Debug, Clone, Default)]
pub struct RulePatch {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub query: Option<Option<String>>,
    pub view_id: Option<Option<ViewId>>,
    pub actions: Option<RuleActions>,
}

#[async_trait]
pub trait RuleRepository {
    /// Ordered by ascending `display_order`; this is the evaluation order.
    async fn list_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>, OctotriageError>;
    async fn get_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
    ) -> Result<Option<Rule>, OctotriageError>;
    async fn create_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        query: Option<String>,
        view_id: Option<ViewId>,
        actions: &RuleActions,
    ) -> Result<Rule, OctotriageError>;
    async fn update_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
        patch: &RulePatch,
    ) -> Result<Rule, OctotriageError>;
    async fn delete_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
    ) -> Result<(), OctotriageError>;
    async fn reorder_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[RuleId],
    ) -> Result<(), OctotriageError>;
}

const RULE_COLUMNS: &str = "id, name, enabled, display_order, query, view_id, actions";

#[async_trait]
impl RuleRepository for Repository {
    #[tracing::instrument(level = "debug", skip_all, fields(enabled_only), err)]
    async fn list_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        enabled_only: bool,
    ) -> Result<Vec<Rule>, OctotriageError> {
        let mut builder = QueryBuilder::new(format!("SELECT {RULE_COLUMNS} FROM rule"));
        if enabled_only {
            builder.push(" WHERE enabled = TRUE");
        }
        builder.push(" ORDER BY display_order, id");

        let rows = builder
            .build_query_as::<RuleRow>()
            .fetch_all(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch rules from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        rows.into_iter().map(Rule::try_from).collect()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = id.to_string()), err)]
    async fn get_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
    ) -> Result<Option<Rule>, OctotriageError> {
        let row = QueryBuilder::new(format!("SELECT {RULE_COLUMNS} FROM rule WHERE id = "))
            .push_bind(id.0)
            .build_query_as::<RuleRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to fetch rule {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        row.map(Rule::try_from).transpose()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(name = name), err)]
    async fn create_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        name: &str,
        query: Option<String>,
        view_id: Option<ViewId>,
        actions: &RuleActions,
    ) -> Result<Rule, OctotriageError> {
        let actions_json = serde_json::to_value(actions)
            .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                "Failed to serialize rule actions: {err}"
            )))?;

        let mut builder = QueryBuilder::new(
            "INSERT INTO rule (name, enabled, query, view_id, actions, display_order) VALUES (",
        );
        let mut separated = builder.separated(", ");
        separated.push_bind(name);
        separated.push_bind(true);
        separated.push_bind(query);
        separated.push_bind(view_id.map(|id| id.0));
        separated.push_bind(actions_json);
        builder
            .push(", (SELECT COALESCE(MAX(display_order), 0) + 1 FROM rule))")
            .push(format!(" RETURNING {RULE_COLUMNS}"));

        let row = builder
            .build_query_as::<RuleRow>()
            .fetch_one(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "rule",
                        name: name.to_string(),
                    }
                } else {
                    let message = format!("Failed to insert rule `{name}` into storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        row.try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = id.to_string()), err)]
    async fn update_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
        patch: &RulePatch,
    ) -> Result<Rule, OctotriageError> {
        let mut builder = QueryBuilder::new("UPDATE rule SET ");
        let mut separated = builder.separated(", ");
        if let Some(name) = &patch.name {
            separated.push("name = ").push_bind_unseparated(name.clone());
        }
        if let Some(enabled) = patch.enabled {
            separated.push("enabled = ").push_bind_unseparated(enabled);
        }
        if let Some(query) = &patch.query {
            separated.push("query = ").push_bind_unseparated(query.clone());
        }
        if let Some(view_id) = &patch.view_id {
            separated
                .push("view_id = ")
                .push_bind_unseparated(view_id.map(|id| id.0));
        }
        if let Some(actions) = &patch.actions {
            let actions_json = serde_json::to_value(actions)
                .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                    "Failed to serialize rule actions: {err}"
                )))?;
            separated.push("actions = ").push_bind_unseparated(actions_json);
        }
        builder.push(" WHERE id = ").push_bind(id.0);
        builder.push(format!(" RETURNING {RULE_COLUMNS}"));

        let row = builder
            .build_query_as::<RuleRow>()
            .fetch_optional(&mut **executor)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    OctotriageError::AlreadyExists {
                        source: Some(err),
                        kind: "rule",
                        name: patch.name.clone().unwrap_or_default(),
                    }
                } else {
                    let message = format!("Failed to update rule {id} in storage: {err}");
                    OctotriageError::DatabaseError { source: err, message }
                }
            })?;

        row.ok_or_else(|| OctotriageError::ItemNotFound(format!("rule {id}")))?
            .try_into()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(rule_id = id.to_string()), err)]
    async fn delete_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        id: RuleId,
    ) -> Result<(), OctotriageError> {
        let result = QueryBuilder::new("DELETE FROM rule WHERE id = ")
            .push_bind(id.0)
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to delete rule {id} from storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        if result.rows_affected() == 0 {
            return Err(OctotriageError::ItemNotFound(format!("rule {id}")));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    async fn reorder_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[RuleId],
    ) -> Result<(), OctotriageError> {
        let ids: Vec<i64> = ordered_ids.iter().map(|id| id.0).collect();
        let orders: Vec<i32> = (1..=ids.len() as i32).collect();

        QueryBuilder::new("UPDATE rule SET display_order = ord.display_order FROM unnest(")
            .push_bind(ids)
            .push(", ")
            .push_bind(orders)
            .push(") AS ord(id, display_order) WHERE rule.id = ord.id")
            .build()
            .execute(&mut **executor)
            .await
            .map_err(|err| {
                let message = format!("Failed to reorder rules in storage: {err}");
                OctotriageError::DatabaseError { source: err, message }
            })?;

        Ok(())
    }
}

#[derive(Debug)]
struct RuleRow {
    id: i64,
    name: String,
    enabled: bool,
    display_order: i32,
    query: Option<String>,
    view_id: Option<i64>,
    actions: serde_json::Value,
}

impl FromRow<'_, PgRow> for RuleRow {
    fn from_row(row: &PgRow) -> sqlx::Result<Self> {
        Ok(RuleRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            display_order: row.try_get("display_order")?,
            query: row.try_get("query")?,
            view_id: row.try_get("view_id")?,
            actions: row.try_get("actions")?,
        })
    }
}

impl TryFrom<RuleRow> for Rule {
    type Error = OctotriageError;

    fn try_from(row: RuleRow) -> Result<Self, Self::Error> {
        let actions: RuleActions = serde_json::from_value(row.actions.clone()).map_err(|err| {
            OctotriageError::from_json_serde_error(err, row.actions.to_string())
        })?;

        Ok(Rule {
            id: row.id.into(),
            name: row.name,
            enabled: row.enabled,
            display_order: row.display_order,
            query: row.query,
            view_id: row.view_id.map(Into::into),
            actions,
        })
    }
}
