use std::sync::Arc;

use sqlx::{Postgres, Transaction};

use octotriage::{
    tag::slugify,
    view::{CreateViewParameters, UpdateViewParameters, View},
    ViewId,
};

use crate::{
    octotriage::OctotriageError,
    repository::{
        view::{ViewPatch, ViewRepository},
        Repository,
    },
    search,
};

pub struct ViewService {
    repository: Arc<Repository>,
}

impl ViewService {
    pub fn new(repository: Arc<Repository>) -> Self {
        ViewService { repository }
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn list_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<View>, OctotriageError> {
        self.repository.list_views(executor).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn get_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        view_id: ViewId,
    ) -> Result<Option<View>, OctotriageError> {
        self.repository.get_view(executor, view_id).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), fields(name = parameters.name), err)]
    pub async fn create_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &CreateViewParameters,
    ) -> Result<View, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;
        let query = normalize_query(parameters.query.clone())?;
        let slug = valid_slug(&parameters.name)?;
        self.repository
            .create_view(executor, &parameters.name, &slug, query)
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), err)]
    pub async fn update_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        view_id: ViewId,
        parameters: &UpdateViewParameters,
    ) -> Result<View, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;

        let existing = self
            .repository
            .get_view(executor, view_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("view {view_id}")))?;
        if existing.system_view && parameters.name.is_some() {
            return Err(OctotriageError::Forbidden(
                "Built-in views cannot be renamed".to_string(),
            ));
        }

        let query = parameters
            .query
            .as_ref()
            .map(|q| normalize_query(Some(q.clone())))
            .transpose()?;
        let slug = parameters.name.as_deref().map(valid_slug).transpose()?;
        let patch = ViewPatch {
            name: parameters.name.clone(),
            slug,
            query,
        };
        self.repository.update_view(executor, view_id, &patch).await
    }

    /// Built-in system views cannot be deleted.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn delete_view(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        view_id: ViewId,
    ) -> Result<(), OctotriageError> {
        let existing = self
            .repository
            .get_view(executor, view_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("view {view_id}")))?;
        if existing.system_view {
            return Err(OctotriageError::Forbidden(
                "Built-in views cannot be deleted".to_string(),
            ));
        }
        self.repository.delete_view(executor, view_id).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    pub async fn reorder_views(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[ViewId],
    ) -> Result<(), OctotriageError> {
        self.repository.reorder_views(executor, ordered_ids).await
    }
}

/// A view's query must at least parse; an empty text is stored as NULL.
fn normalize_query(query: Option<String>) -> Result<Option<String>, OctotriageError> {
    match query {
        Some(query) if !query.trim().is_empty() => {
            search::parse(&query)?;
            Ok(Some(query))
        }
        _ => Ok(None),
    }
}

fn valid_slug(name: &str) -> Result<String, OctotriageError> {
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(OctotriageError::InvalidInputData {
            source: None,
            user_error: format!("`{name}` does not reduce to a usable slug"),
        });
    }
    Ok(slug)
}
