use std::sync::Arc;

use actix_web::{web, HttpResponse, Scope};
use anyhow::Context;

use octotriage::{
    view::{CreateViewParameters, UpdateViewParameters},
    ViewId,
};

use crate::{
    octotriage::{view::service::ViewService, OctotriageError},
    routes::tag::ReorderRequest,
    utils::jwt::Authenticated,
};

pub fn scope() -> Scope {
    web::scope("/views")
        .route("", web::get().to(list_views))
        .route("", web::post().to(create_view))
        .route("/reorder", web::put().to(reorder_views))
        .route("/{view_id}", web::get().to(get_view))
        .route("/{view_id}", web::put().to(update_view))
        .route("/{view_id}", web::delete().to(delete_view))
}

pub async fn list_views(
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = view_service.begin().await?;
    let views = view_service.list_views(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&views).context("Cannot serialize views")?))
}

pub async fn get_view(
    path: web::Path<ViewId>,
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let view_id = path.into_inner();
    let mut transaction = view_service.begin().await?;
    let view = view_service
        .get_view(&mut transaction, view_id)
        .await?
        .ok_or_else(|| OctotriageError::ItemNotFound(format!("view {view_id}")))?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&view).context("Cannot serialize view")?))
}

pub async fn create_view(
    parameters: web::Json<CreateViewParameters>,
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = view_service.begin().await?;
    let view = view_service
        .create_view(&mut transaction, &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit view creation")?;
    Ok(HttpResponse::Created()
        .content_type("application/json")
        .body(serde_json::to_string(&view).context("Cannot serialize view")?))
}

pub async fn update_view(
    path: web::Path<ViewId>,
    parameters: web::Json<UpdateViewParameters>,
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = view_service.begin().await?;
    let view = view_service
        .update_view(&mut transaction, path.into_inner(), &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit view update")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&view).context("Cannot serialize view")?))
}

pub async fn delete_view(
    path: web::Path<ViewId>,
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = view_service.begin().await?;
    view_service
        .delete_view(&mut transaction, path.into_inner())
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit view deletion")?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn reorder_views(
    request: web::Json<ReorderRequest<ViewId>>,
    view_service: web::Data<Arc<ViewService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = view_service.begin().await?;
    view_service
        .reorder_views(&mut transaction, &request.ids)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit view reordering")?;
    Ok(HttpResponse::NoContent().finish())
}
