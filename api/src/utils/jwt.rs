use std::{future::ready, future::Ready, time::Duration};

use actix_web::{dev::Payload, web, FromRequest, HttpRequest};
use anyhow::{anyhow, Context};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::octotriage::OctotriageError;

pub const JWT_SIGNING_ALGO: Algorithm = Algorithm::HS256;
pub const SESSION_COOKIE: &str = "octotriage_session";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "X-CSRF-Token";

/// Symmetric signing keys derived from `JWT_SECRET`.
#[derive(Clone)]
pub struct JwtKeys {
    pub encoding_key: EncodingKey,
    pub decoding_key: DecodingKey,
}

impl JwtKeys {
    pub fn from_secret(secret: &Secret<String>) -> Self {
        let secret = secret.expose_secret().as_bytes();
        JwtKeys {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub exp: usize,
    pub iat: usize,
    pub sub: String,
}

impl Claims {
    pub fn new_jwt_token(
        sub: String,
        ttl: Duration,
        encoding_key: &EncodingKey,
    ) -> Result<String, OctotriageError> {
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            iat: now,
            exp: now + ttl.as_secs() as usize,
            sub,
        };
        Ok(
            jsonwebtoken::encode(&Header::new(JWT_SIGNING_ALGO), &claims, encoding_key)
                .context("Failed to encode JSON web token")?,
        )
    }
}

pub fn decode_claims(token: &str, decoding_key: &DecodingKey) -> Result<Claims, OctotriageError> {
    let data = jsonwebtoken::decode::<Claims>(
        token,
        decoding_key,
        &Validation::new(JWT_SIGNING_ALGO),
    )
    .map_err(|err| OctotriageError::Unauthorized(anyhow!("Invalid session token: {err}")))?;
    Ok(data.claims)
}

/// Random value for the double-submit CSRF cookie/header pair.
pub fn generate_csrf_token() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(bytes)
}

fn bearer_token(request: &HttpRequest) -> Option<String> {
    if let Some(header) = request.headers().get("Authorization") {
        if let Ok(value) = header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    request
        .cookie(SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
}

/// Best-effort claims lookup used by the request root span; no CSRF check.
pub fn claims_from_request(request: &HttpRequest) -> Option<Claims> {
    let keys = request.app_data::<web::Data<JwtKeys>>()?;
    let token = bearer_token(request)?;
    decode_claims(&token, &keys.decoding_key).ok()
}

/// Extractor guarding every `/api` handler: a valid bearer session, plus the
/// double-submit CSRF cookie/header pair on mutating methods.
pub struct Authenticated {
    pub claims: Claims,
}

impl FromRequest for Authenticated {
    type Error = OctotriageError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(request: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(authenticate(request))
    }
}

fn authenticate(request: &HttpRequest) -> Result<Authenticated, OctotriageError> {
    let keys = request
        .app_data::<web::Data<JwtKeys>>()
        .ok_or_else(|| OctotriageError::Unexpected(anyhow!("JWT keys are not configured")))?;
    let token = bearer_token(request)
        .ok_or_else(|| OctotriageError::Unauthorized(anyhow!("Missing session token")))?;
    let claims = decode_claims(&token, &keys.decoding_key)?;

    let is_mutating = !matches!(
        request.method().as_str(),
        "GET" | "HEAD" | "OPTIONS"
    );
    if is_mutating {
        let cookie = request
            .cookie(CSRF_COOKIE)
            .map(|cookie| cookie.value().to_string())
            .ok_or_else(|| OctotriageError::Forbidden("Missing CSRF cookie".to_string()))?;
        let header = request
            .headers()
            .get(CSRF_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| OctotriageError::Forbidden("Missing CSRF header".to_string()))?;
        if cookie != header {
            return Err(OctotriageError::Forbidden(
                "CSRF token mismatch".to_string(),
            ));
        }
    }

    Ok(Authenticated { claims })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn keys() -> JwtKeys {
        JwtKeys::from_secret(&Secret::new("a unit test signing secret".to_string()))
    }

    #[test]
    fn test_jwt_round_trip() {
        let keys = keys();
        let token =
            Claims::new_jwt_token("1".to_string(), Duration::from_secs(3600), &keys.encoding_key)
                .unwrap();
        let claims = decode_claims(&token, &keys.decoding_key).unwrap();
        assert_eq!(claims.sub, "1");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let keys = keys();
        let now = Utc::now().timestamp() as usize;
        let claims = Claims {
            iat: now - 7200,
            exp: now - 3600,
            sub: "1".to_string(),
        };
        let token =
            jsonwebtoken::encode(&Header::new(JWT_SIGNING_ALGO), &claims, &keys.encoding_key)
                .unwrap();
        assert!(matches!(
            decode_claims(&token, &keys.decoding_key),
            Err(OctotriageError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let other = JwtKeys::from_secret(&Secret::new("another secret".to_string()));
        let token =
            Claims::new_jwt_token("1".to_string(), Duration::from_secs(3600), &other.encoding_key)
                .unwrap();
        assert!(decode_claims(&token, &keys().decoding_key).is_err());
    }

    #[test]
    fn test_csrf_tokens_are_unique() {
        assert_ne!(generate_csrf_token(), generate_csrf_token());
        assert_eq!(generate_csrf_token().len(), 64);
    }
}
