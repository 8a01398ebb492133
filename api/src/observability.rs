use actix_http::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use tracing::{subscriber::set_global_default, Span, Subscriber};
use tracing_actix_web::{DefaultRootSpanBuilder, RootSpanBuilder};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

use crate::utils::jwt::claims_from_request;

pub fn get_subscriber(service_name: &str, env_filter_str: &str) -> impl Subscriber + Send + Sync {
    let formatting_layer = BunyanFormattingLayer::new(service_name.into(), std::io::stdout);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(env_filter_str));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer)
}

pub fn init_subscriber(
    subscriber: impl Subscriber + Send + Sync,
    log_level_filter: log::LevelFilter,
) {
    LogTracer::init_with_filter(log_level_filter).expect("Failed to set logger");
    set_global_default(subscriber).expect("Failed to set subscriber");
}

pub struct AuthenticatedRootSpanBuilder;

/// Root span builder that records the authenticated user id when the request
/// carries a valid session token.
impl RootSpanBuilder for AuthenticatedRootSpanBuilder {
    fn on_request_start(request: &ServiceRequest) -> Span {
        match claims_from_request(request.request()) {
            Some(claims) => {
                let session_user_id = claims.sub;
                tracing_actix_web::root_span!(request, session_user_id)
            }
            None => {
                tracing_actix_web::root_span!(request)
            }
        }
    }

    fn on_request_end<B: MessageBody>(
        span: Span,
        outcome: &Result<ServiceResponse<B>, actix_web::Error>,
    ) {
        DefaultRootSpanBuilder::on_request_end(span, outcome);
    }
}
