use std::sync::Arc;

use sqlx::{Postgres, Transaction};

use octotriage::{
    tag::{slugify, CreateTagParameters, Tag, TaggableEntity, UpdateTagParameters},
    NotificationId, TagId,
};

use crate::{
    octotriage::OctotriageError,
    repository::{
        notification::NotificationRepository,
        tag::{TagPatch, TagRepository},
        Repository,
    },
};

pub struct TagService {
    repository: Arc<Repository>,
}

impl TagService {
    pub fn new(repository: Arc<Repository>) -> Self {
        TagService { repository }
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn list_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<Tag>, OctotriageError> {
        self.repository.list_tags(executor).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), fields(name = parameters.name), err)]
    pub async fn create_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &CreateTagParameters,
    ) -> Result<Tag, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;
        let slug = valid_slug(&parameters.name)?;
        self.repository
            .create_tag(
                executor,
                &parameters.name,
                &slug,
                parameters.color.clone(),
                parameters.description.clone(),
            )
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), err)]
    pub async fn update_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        parameters: &UpdateTagParameters,
    ) -> Result<Tag, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;
        let slug = parameters
            .name
            .as_deref()
            .map(valid_slug)
            .transpose()?;
        let patch = TagPatch {
            name: parameters.name.clone(),
            slug,
            color: parameters.color.clone().map(Some),
            description: parameters.description.clone().map(Some),
        };
        self.repository.update_tag(executor, tag_id, &patch).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn delete_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
    ) -> Result<(), OctotriageError> {
        self.repository.delete_tag(executor, tag_id).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    pub async fn reorder_tags(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[TagId],
    ) -> Result<(), OctotriageError> {
        self.repository.reorder_tags(executor, ordered_ids).await
    }

    /// Assign a tag to a notification and refresh the denormalized
    /// `tag_ids` array. Returns `false` when the tag was already assigned.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn assign_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity: TaggableEntity,
        entity_id: NotificationId,
    ) -> Result<bool, OctotriageError> {
        self.repository
            .get_tag(executor, tag_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("tag {tag_id}")))?;

        let newly_assigned = self
            .repository
            .assign_tag_to_entity(executor, tag_id, entity.as_entity_type(), entity_id.0)
            .await?;
        self.repository
            .update_notification_tag_ids(executor, entity_id)
            .await?;
        Ok(newly_assigned)
    }

    /// Remove an assignment and refresh `tag_ids`. Returns `false` when
    /// there was nothing to remove.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn remove_tag(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        tag_id: TagId,
        entity: TaggableEntity,
        entity_id: NotificationId,
    ) -> Result<bool, OctotriageError> {
        let removed = self
            .repository
            .remove_tag_assignment(executor, tag_id, entity.as_entity_type(), entity_id.0)
            .await?;
        self.repository
            .update_notification_tag_ids(executor, entity_id)
            .await?;
        Ok(removed)
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
