pub mod health_check;
pub mod notification;
pub mod rule;
pub mod tag;
pub mod user;
pub mod view;

use actix_http::{body::BoxBody, header::TryIntoHeaderValue, StatusCode};
use actix_web::{
    http::header::{self, ContentType},
    HttpResponse, ResponseError,
};
use serde_json::json;

use crate::octotriage::OctotriageError;

impl ResponseError for OctotriageError {
    fn status_code(&self) -> StatusCode {
        match self {
            OctotriageError::InvalidEnumData { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OctotriageError::InvalidUrlData { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OctotriageError::InvalidInputData { .. } => StatusCode::BAD_REQUEST,
            OctotriageError::InvalidParameters(_) => StatusCode::BAD_REQUEST,
            OctotriageError::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            OctotriageError::AlreadyExists { .. } => StatusCode::CONFLICT,
            OctotriageError::ItemNotFound(_) => StatusCode::NOT_FOUND,
            OctotriageError::DatabaseError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            OctotriageError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            OctotriageError::Forbidden(_) => StatusCode::FORBIDDEN,
            OctotriageError::Recoverable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OctotriageError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        let mut res = HttpResponse::new(self.status_code());

        res.headers_mut().insert(
            header::CONTENT_TYPE,
            ContentType::json().try_into_value().unwrap(),
        );

        res.set_body(BoxBody::new(
            json!({ "message": format!("{}", self) }).to_string(),
        ))
    }
}
