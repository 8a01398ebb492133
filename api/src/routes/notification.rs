use std::sync::Arc;

use actix_http::body::BoxBody;
use actix_web::{web, HttpResponse, Scope};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use octotriage::notification::NotificationStateChange;

use crate::{
    octotriage::{
        notification::service::{BulkAction, BulkSelector, NotificationService},
        sync::service::SyncService,
        OctotriageError,
    },
    utils::jwt::Authenticated,
};

pub fn scope() -> Scope {
    web::scope("/notifications")
        .route("/poll", web::get().to(poll_notifications))
        .route("/bulk", web::post().to(bulk_update))
        .service(
            web::resource("")
                .name("notifications")
                .route(web::get().to(list_notifications)),
        )
        .route("/{github_id}/snooze", web::post().to(snooze_notification))
        .route("/{github_id}/timeline", web::get().to(fetch_timeline))
        .route("/{github_id}/comments", web::get().to(fetch_comments))
        .route("/{github_id}/reviews", web::get().to(fetch_reviews))
        .route(
            "/{github_id}/refresh-subject",
            web::post().to(refresh_subject),
        )
        .route("/{github_id}/{action}", web::post().to(apply_state_change))
        .route("/{github_id}", web::get().to(get_notification))
}

#[derive(Debug, Deserialize)]
pub struct ListNotificationsRequest {
    #[serde(default)]
    q: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

pub async fn list_notifications(
    request: web::Query<ListNotificationsRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = notification_service.begin().await?;
    let page = notification_service
        .list_notifications(
            &mut transaction,
            request.q.as_deref().unwrap_or(""),
            request.limit,
            request.offset,
        )
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&page).context("Cannot serialize notifications page")?))
}

pub async fn poll_notifications(
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = notification_service.begin().await?;
    let items = notification_service
        .poll_notifications(&mut transaction)
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&items).context("Cannot serialize poll items")?))
}

pub async fn get_notification(
    path: web::Path<String>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = notification_service.begin().await?;
    match notification_service
        .get_notification(&mut transaction, &github_id)
        .await?
    {
        Some(notification) => Ok(HttpResponse::Ok()
            .content_type("application/json")
            .body(serde_json::to_string(&notification).context("Cannot serialize notification")?)),
        None => Ok(HttpResponse::NotFound()
            .content_type("application/json")
            .body(BoxBody::new(
                json!({ "message": format!("Cannot find notification {github_id}") }).to_string(),
            ))),
    }
}

fn state_change_from_action(action: &str) -> Result<NotificationStateChange, OctotriageError> {
    match action {
        "read" => Ok(NotificationStateChange::MarkRead),
        "unread" => Ok(NotificationStateChange::MarkUnread),
        "archive" => Ok(NotificationStateChange::Archive),
        "unarchive" => Ok(NotificationStateChange::Unarchive),
        "mute" => Ok(NotificationStateChange::Mute),
        "unmute" => Ok(NotificationStateChange::Unmute),
        "star" => Ok(NotificationStateChange::Star),
        "unstar" => Ok(NotificationStateChange::Unstar),
        "filter" => Ok(NotificationStateChange::MarkFiltered),
        "unfilter" => Ok(NotificationStateChange::MarkUnfiltered),
        "unsnooze" => Ok(NotificationStateChange::Unsnooze),
        other => Err(OctotriageError::InvalidInputData {
            source: None,
            user_error: format!("Unknown notification action `{other}`"),
        }),
    }
}

pub async fn apply_state_change(
    path: web::Path<(String, String)>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let (github_id, action) = path.into_inner();
    let change = state_change_from_action(&action)?;
    let mut transaction = notification_service.begin().await?;
    let notification = notification_service
        .apply_state_change(&mut transaction, &github_id, change)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit notification state change")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&notification).context("Cannot serialize notification")?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozeRequest {
    snoozed_until: DateTime<Utc>,
}

pub async fn snooze_notification(
    path: web::Path<String>,
    request: web::Json<SnoozeRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = notification_service.begin().await?;
    let notification = notification_service
        .snooze_notification(&mut transaction, &github_id, request.snoozed_until)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit notification snooze")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&notification).context("Cannot serialize notification")?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkUpdateRequest {
    #[serde(default)]
    github_ids: Option<Vec<String>>,
    #[serde(default)]
    query: Option<String>,
    action: String,
    #[serde(default)]
    snoozed_until: Option<DateTime<Utc>>,
}

pub async fn bulk_update(
    request: web::Json<BulkUpdateRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let request = request.into_inner();
    let selector = match (request.github_ids, request.query) {
        (Some(github_ids), None) => BulkSelector::GithubIds { github_ids },
        (None, Some(query)) => BulkSelector::Query { query },
        _ => {
            return Err(OctotriageError::InvalidInputData {
                source: None,
                user_error: "Provide either `githubIds` or `query`, not both".to_string(),
            })
        }
    };
    let action = match request.action.as_str() {
        "snooze" => {
            let snoozed_until =
                request
                    .snoozed_until
                    .ok_or_else(|| OctotriageError::InvalidInputData {
                        source: None,
                        user_error: "Bulk snooze requires `snoozedUntil`".to_string(),
                    })?;
            BulkAction::Snooze(snoozed_until)
        }
        other => BulkAction::State(state_change_from_action(other)?),
    };

    let mut transaction = notification_service.begin().await?;
    let affected = notification_service
        .bulk_update(&mut transaction, &selector, action)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit bulk notification update")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(json!({ "affected": affected }).to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPageRequest {
    per_page: Option<usize>,
    page: Option<u32>,
}

impl ActivityPageRequest {
    fn per_page(&self) -> usize {
        self.per_page.unwrap_or(50).clamp(1, 100)
    }

    fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }
}

pub async fn fetch_timeline(
    path: web::Path<String>,
    request: web::Query<ActivityPageRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = notification_service.begin().await?;
    let timeline = notification_service
        .fetch_timeline(&mut transaction, &github_id, request.per_page(), request.page())
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&timeline).context("Cannot serialize timeline")?))
}

pub async fn fetch_comments(
    path: web::Path<String>,
    request: web::Query<ActivityPageRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = notification_service.begin().await?;
    let comments = notification_service
        .fetch_issue_comments(&mut transaction, &github_id, request.per_page(), request.page())
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&comments).context("Cannot serialize comments")?))
}

pub async fn fetch_reviews(
    path: web::Path<String>,
    request: web::Query<ActivityPageRequest>,
    notification_service: web::Data<Arc<NotificationService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = notification_service.begin().await?;
    let reviews = notification_service
        .fetch_pull_request_reviews(&mut transaction, &github_id, request.per_page(), request.page())
        .await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&reviews).context("Cannot serialize reviews")?))
}

pub async fn refresh_subject(
    path: web::Path<String>,
    sync_service: web::Data<Arc<SyncService>>,
    _authenticated: Authenticated,
) -> Result<HttpResponse, OctotriageError> {
    let github_id = path.into_inner();
    let mut transaction = sync_service.begin().await?;
    let notification = sync_service
        .refresh_subject_data(&mut transaction, &github_id)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit subject refresh")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&notification).context("Cannot serialize notification")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("read", NotificationStateChange::MarkRead)]
    #[case("unfilter", NotificationStateChange::MarkUnfiltered)]
    #[case("unsnooze", NotificationStateChange::Unsnooze)]
    fn test_state_change_from_action(
        #[case] action: &str,
        #[case] expected: NotificationStateChange,
    ) {
        assert_eq!(state_change_from_action(action).unwrap(), expected);
    }

    #[test]
    fn test_unknown_action_is_a_caller_error() {
        assert!(matches!(
            state_change_from_action("explode"),
            Err(OctotriageError::InvalidInputData { .. })
        ));
    }
}
