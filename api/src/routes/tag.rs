use std::sync::Arc;

use actix_web::{web, HttpResponse, Scope};
use anyhow::Context;
use serde::Deserialize;
use serde_json::json;

use octotriage::{
    tag::{CreateTagParameters, TaggableEntity, UpdateTagParameters},
    NotificationId, TagId,
};

use crate::{
    octotriage::{tag::service::TagService, OctotriageError},
    utils::jwt::Authenticated,
};

pub fn scope() -> Scope {
    web::scope("/tags")
        .route("", web::get().to(list_tags))
        .route("", web::post().to(create_tag))
        .route("/reorder", web::put().to(reorder_tags))
        .route("/{tag_id}", web::put().to(update_tag))
        .route("/{tag_id}", web::delete().to(delete_tag))
        .route("/{tag_id}/assignments", web::post().to(assign_tag))
        .route("/{tag_id}/assignments", web::delete().to(remove_assignment))
}

pub async fn list_tags(
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = tag_service.begin().await?;
    let tags = tag_service.list_tags(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&tags).context("Cannot serialize tags")?))
}

pub async fn create_tag(
    parameters: web::Json<CreateTagParameters>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = tag_service.begin().await?;
    let tag = tag_service.create_tag(&mut transaction, &parameters).await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag creation")?;
    Ok(HttpResponse::Created()
        .content_type("application/json")
        .body(serde_json::to_string(&tag).context("Cannot serialize tag")?))
}

pub async fn update_tag(
    path: web::Path<TagId>,
    parameters: web::Json<UpdateTagParameters>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = tag_service.begin().await?;
    let tag = tag_service
        .update_tag(&mut transaction, path.into_inner(), &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag update")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&tag).context("Cannot serialize tag")?))
}

pub async fn delete_tag(
    path: web::Path<TagId>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = tag_service.begin().await?;
    tag_service
        .delete_tag(&mut transaction, path.into_inner())
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag deletion")?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest<T> {
    pub ids: Vec<T>,
}

pub async fn reorder_tags(
    request: web::Json<ReorderRequest<TagId>>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = tag_service.begin().await?;
    tag_service
        .reorder_tags(&mut transaction, &request.ids)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag reordering")?;
    Ok(HttpResponse::NoContent().finish())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentRequest {
    entity_type: String,
    entity_id: NotificationId,
}

impl AssignmentRequest {
    fn entity(&self) -> Result<TaggableEntity, OctotriageError> {
        match self.entity_type.as_str() {
            "notification" => Ok(TaggableEntity::Notification),
            other => Err(OctotriageError::InvalidInputData {
                source: None,
                user_error: format!("Unknown taggable entity type `{other}`"),
            }),
        }
    }
}

pub async fn assign_tag(
    path: web::Path<TagId>,
    request: web::Json<AssignmentRequest>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let entity = request.entity()?;
    let mut transaction = tag_service.begin().await?;
    let newly_assigned = tag_service
        .assign_tag(&mut transaction, path.into_inner(), entity, request.entity_id)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag assignment")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(json!({ "assigned": newly_assigned }).to_string()))
}

pub async fn remove_assignment(
    path: web::Path<TagId>,
    request: web::Json<AssignmentRequest>,
    tag_service: web::Data<Arc<TagService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let entity = request.entity()?;
    let mut transaction = tag_service.begin().await?;
    let removed = tag_service
        .remove_tag(&mut transaction, path.into_inner(), entity, request.entity_id)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit tag removal")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(json!({ "removed": removed }).to_string()))
}
