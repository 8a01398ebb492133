use std::sync::Arc;

use actix_web::{
    cookie::{time::Duration as CookieDuration, Cookie, SameSite},
    web, HttpResponse, Scope,
};
use anyhow::Context;
use serde_json::json;

use octotriage::{
    sync::SyncOlderParameters,
    user::{Credentials, UpdateCredentialsParameters, UpdateSyncSettingsParameters},
};

use crate::{
    configuration::Settings,
    octotriage::{sync::service::SyncService, user::service::UserService, OctotriageError},
    utils::jwt::{
        generate_csrf_token, Authenticated, Claims, JwtKeys, CSRF_COOKIE, SESSION_COOKIE,
    },
};

pub fn scope() -> Scope {
    web::scope("/user")
        .route("/login", web::post().to(login))
        .route("/refresh", web::post().to(refresh))
        .route("/logout", web::post().to(logout))
        .route("/me", web::get().to(me))
        .route("/credentials", web::put().to(update_credentials))
        .route("/sync-settings", web::get().to(get_sync_settings))
        .route("/sync-settings", web::put().to(update_sync_settings))
        .route("/sync-state", web::get().to(get_sync_state))
        .route("/sync-older", web::post().to(sync_older))
}

fn session_cookies(
    user_id: String,
    jwt_keys: &JwtKeys,
    settings: &Settings,
) -> Result<(Cookie<'static>, Cookie<'static>), OctotriageError> {
    let token = Claims::new_jwt_token(user_id, settings.jwt_expiry, &jwt_keys.encoding_key)?;
    let max_age = CookieDuration::seconds(settings.jwt_expiry.as_secs() as i64);
    let secure = settings.secure_cookies.unwrap_or(false);

    let session_cookie = Cookie::build(SESSION_COOKIE, token)
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .finish();
    // Readable by the frontend so it can echo it in the CSRF header.
    let csrf_cookie = Cookie::build(CSRF_COOKIE, generate_csrf_token())
        .path("/")
        .http_only(false)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .finish();
    Ok((session_cookie, csrf_cookie))
}

fn expired_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build(name, "")
        .path("/")
        .max_age(CookieDuration::seconds(0))
        .finish()
}

pub async fn login(
    credentials: web::Json<Credentials>,
    user_service: web::Data<Arc<UserService>>,
    jwt_keys: web::Data<JwtKeys>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = user_service.begin().await?;
    let user = user_service.login(&mut transaction, &credentials).await?;
    transaction
        .commit()
        .await
        .context("Failed to commit while logging in")?;

    let (session_cookie, csrf_cookie) =
        session_cookies(user.id.to_string(), &jwt_keys, &settings)?;
    Ok(HttpResponse::Ok()
        .cookie(session_cookie)
        .cookie(csrf_cookie)
        .content_type("application/json")
        .body(serde_json::to_string(&user).context("Cannot serialize user")?))
}

pub async fn refresh(
    authenticated: Authenticated,
    jwt_keys: web::Data<JwtKeys>,
    settings: web::Data<Settings>,
) -> Result<HttpResponse, OctotriageError> {
    let (session_cookie, csrf_cookie) =
        session_cookies(authenticated.claims.sub, &jwt_keys, &settings)?;
    Ok(HttpResponse::Ok()
        .cookie(session_cookie)
        .cookie(csrf_cookie)
        .content_type("application/json")
        .body(json!({"refreshed": true}).to_string()))
}

pub async fn logout(_authenticated: Authenticated) -> Result<HttpResponse, OctotriageError> {
    Ok(HttpResponse::Ok()
        .cookie(expired_cookie(SESSION_COOKIE))
        .cookie(expired_cookie(CSRF_COOKIE))
        .content_type("application/json")
        .body(json!({"logged_out": true}).to_string()))
}

pub async fn me(
    _authenticated: Authenticated,
    user_service: web::Data<Arc<UserService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = user_service.begin().await?;
    let user = user_service.get_user(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&user).context("Cannot serialize user")?))
}

pub async fn update_credentials(
    _authenticated: Authenticated,
    parameters: web::Json<UpdateCredentialsParameters>,
    user_service: web::Data<Arc<UserService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = user_service.begin().await?;
    let user = user_service
        .update_credentials(&mut transaction, &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit while updating credentials")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&user).context("Cannot serialize user")?))
}

pub async fn get_sync_settings(
    _authenticated: Authenticated,
    user_service: web::Data<Arc<UserService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = user_service.begin().await?;
    let sync_settings = user_service.get_sync_settings(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&sync_settings).context("Cannot serialize sync settings")?))
}

pub async fn update_sync_settings(
    _authenticated: Authenticated,
    parameters: web::Json<UpdateSyncSettingsParameters>,
    user_service: web::Data<Arc<UserService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = user_service.begin().await?;
    let sync_settings = user_service
        .update_sync_settings(&mut transaction, &parameters)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit while updating sync settings")?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&sync_settings).context("Cannot serialize sync settings")?))
}

pub async fn get_sync_state(
    _authenticated: Authenticated,
    sync_service: web::Data<Arc<SyncService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = sync_service.begin().await?;
    let sync_state = sync_service.get_sync_state(&mut transaction).await?;
    Ok(HttpResponse::Ok()
        .content_type("application/json")
        .body(serde_json::to_string(&sync_state).context("Cannot serialize sync state")?))
}

/// Enqueue a backfill bounded by the current oldest checkpoint: 400 when no
/// history has been synced yet, 503 when the queue is unreachable.
pub async fn sync_older(
    _authenticated: Authenticated,
    parameters: web::Json<SyncOlderParameters>,
    sync_service: web::Data<Arc<SyncService>>,
) -> Result<HttpResponse, OctotriageError> {
    let mut transaction = sync_service.begin().await?;
    sync_service
        .request_older_sync(&mut transaction, &parameters)
        .await?;
    Ok(HttpResponse::Accepted()
        .content_type("application/json")
        .body(json!({"enqueued": true}).to_string()))
}
