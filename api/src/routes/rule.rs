use std::sync::Arc;

use actix_web::{web, HttpResponse, Scope};
use anyhow::Context;
use serde_json::json;
use tracing::warn;

use octotriage::{
    rule::{CreateRuleParameters, UpdateRuleParameters},
    RuleId,
};

use crate::{
    octotriage::{rule::service::RuleService, OctotriageError},
    routes::tag::ReorderRequest,
    utils::jwt::Authenticated,
};

pub fn scope() -> Scope {
    web::scope("/rules")
        .route("", web::get().to(list_rules))
        .route("", web::post().to(create_rule))
        .route("/reorder", web::put().to(reorder_rules))
        .route("/{rule_id}", web::get().to(get_rule))
        .route("/{rule_id}", web::put().to(update_rule))
        .route("/{rule_id}", web::delete().to(delete_rule))
        .route("/{rule_id}/apply", web::post().to(apply_rule))
}

pub async fn list_rules(
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    let rules = rule_service.list_rules(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&rules).context("Cannot serialize rules")?))
}

pub async fn get_rule(
    path: web::Path<RuleId>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let rule_id = path.into_inner();
    let mut transaction = rule_service.begin().await?;
    let rule = rule_service
        .get_rule(&mut transaction, rule_id)
        .await?
        .ok_or_else(|| OctotriageError::ItemNotFound(format!("rule {rule_id}")))?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&rule).context("Cannot serialize rule")?))
}

/// Create a rule; with `applyToExisting` the retroactive application job is
/// enqueued once the rule is committed.
pub async fn create_rule(
    parameters: web::Json<CreateRuleParameters>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    let rule = rule_service
        .create_rule(&mut transaction, &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit rule creation")?;

    if parameters.apply_to_existing {
        if let Err(err) = rule_service.enqueue_apply_rule(rule.id).await {
            // The rule itself is created; the user can retry the backfill
            // through the apply endpoint.
            warn!(
                "Rule `{}` created but retroactive application could not be enqueued: {err:?}",
                rule.name
            );
        }
    }

    Ok(HttpResponse::Created()
        .content_type("application/json")
        .body(serde_json::to_string(&rule).context("Cannot serialize rule")?))
}

pub async fn update_rule(
    path: web::Path<RuleId>,
    parameters: web::Json<UpdateRuleParameters>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    let rule = rule_service
        .update_rule(&mut transaction, path.into_inner(), &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit rule update")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&rule).context("Cannot serialize rule")?))
}

pub async fn delete_rule(
    path: web::Path<RuleId>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    rule_service
        .delete_rule(&mut transaction, path.into_inner())
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit rule deletion")?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn reorder_rules(
    request: web::Json<ReorderRequest<RuleId>>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    rule_service
        .reorder_rules(&mut transaction, &request.ids)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit rule reordering")?;
    Ok(HttpResponse::NoContent().finish())
}

/// Enqueue retroactive application of an existing rule.
pub async fn apply_rule(
    path: web::Path<RuleId>,
    rule_service: web::Data<Arc<RuleService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let rule_id = path.into_inner();
    let mut transaction = rule_service.begin().await?;
    rule_service
        .get_rule(&mut transaction, rule_id)
        .await?
        .ok_or_else(|| OctotriageError::ItemNotFound(format!("rule {rule_id}")))?;
    drop(transaction);

    rule_service.enqueue_apply_rule(rule_id).await?;
    Ok(HttpResponse::Accepted()
        .content_type("application/json")
        .body(json!({"enqueued": true}).to_string()))
}
