#[macro_use]
extern crate macro_attr;

#[macro_use]
extern crate enum_derive;

use std::{future::Future, net::TcpListener, sync::Arc, time::Duration};

use actix_cors::Cors;
use actix_web::{dev::Server, http, middleware, web, App, HttpServer};
use anyhow::Context;
use sqlx::PgPool;
use tracing::info;
use tracing_actix_web::TracingLogger;

use crate::{
    configuration::Settings,
    integrations::github::GithubService,
    jobs::{
        TriageJob, TriageJobHandler, APPLY_RULE_QUEUE, APPLY_RULE_QUEUE_WORKERS, PROCESS_QUEUE,
        PROCESS_QUEUE_WORKERS, SYNC_QUEUE, SYNC_QUEUE_WORKERS,
    },
    observability::AuthenticatedRootSpanBuilder,
    octotriage::{
        notification::service::NotificationService, rule::service::RuleService,
        sync::service::SyncService, tag::service::TagService, user::service::UserService,
        view::service::ViewService, OctotriageError,
    },
    queue::{JobClient, PeriodicJob, QueueServer},
    repository::Repository,
    utils::jwt::JwtKeys,
};

pub mod commands;
pub mod configuration;
pub mod integrations;
pub mod jobs;
pub mod observability;
pub mod octotriage;
pub mod queue;
pub mod repository;
pub mod routes;
pub mod search;
pub mod utils;

const GITHUB_PAGE_SIZE: usize = 100;

/// Every stateful façade the process wires up, shared between the HTTP
/// server and the worker.
#[derive(Clone)]
pub struct Services {
    pub notification_service: Arc<NotificationService>,
    pub tag_service: Arc<TagService>,
    pub view_service: Arc<ViewService>,
    pub rule_service: Arc<RuleService>,
    pub user_service: Arc<UserService>,
    pub sync_service: Arc<SyncService>,
    pub github_service: Arc<GithubService>,
}

pub fn build_services(
    pool: Arc<PgPool>,
    github_base_url: Option<String>,
) -> Result<Services, OctotriageError> {
    let repository = Arc::new(Repository::new(pool.clone()));
    let github_service = Arc::new(GithubService::new(github_base_url, GITHUB_PAGE_SIZE)?);
    let job_client = JobClient::new(pool);

    let notification_service = Arc::new(NotificationService::new(
        repository.clone(),
        github_service.clone(),
    ));
    let tag_service = Arc::new(TagService::new(repository.clone()));
    let view_service = Arc::new(ViewService::new(repository.clone()));
    let rule_service = Arc::new(RuleService::new(repository.clone(), job_client.clone()));
    let user_service = Arc::new(UserService::new(repository.clone())?);
    let sync_service = Arc::new(SyncService::new(
        repository,
        github_service.clone(),
        job_client,
    ));

    Ok(Services {
        notification_service,
        tag_service,
        view_service,
        rule_service,
        user_service,
        sync_service,
        github_service,
    })
}

pub fn run_server(
    listener: TcpListener,
    settings: Settings,
    services: Services,
) -> Result<Server, OctotriageError> {
    let listen_address = listener.local_addr().context("Failed to read listen address")?;
    let jwt_keys = JwtKeys::from_secret(&settings.jwt_secret);
    let allowed_origins = settings.allowed_origins();

    info!("Listening on {listen_address}");

    let server = HttpServer::new(move || {
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "PUT", "PATCH", "DELETE"])
            .allowed_headers(vec![
                http::header::AUTHORIZATION,
                http::header::COOKIE,
                http::header::CONTENT_TYPE,
                http::header::HeaderName::from_static("x-csrf-token"),
            ])
            .supports_credentials()
            .max_age(3600);
        for origin in &allowed_origins {
            cors = cors.allowed_origin(origin);
        }

        let api_scope = web::scope("/api")
            .service(routes::user::scope())
            .service(routes::notification::scope())
            .service(routes::tag::scope())
            .service(routes::view::scope())
            .service(routes::rule::scope());

        App::new()
            .wrap(TracingLogger::<AuthenticatedRootSpanBuilder>::new())
            .wrap(middleware::Compress::default())
            .wrap(cors)
            .route("/ping", web::get().to(routes::health_check::ping))
            .service(api_scope)
            .app_data(web::Data::new(services.notification_service.clone()))
            .app_data(web::Data::new(services.tag_service.clone()))
            .app_data(web::Data::new(services.view_service.clone()))
            .app_data(web::Data::new(services.rule_service.clone()))
            .app_data(web::Data::new(services.user_service.clone()))
            .app_data(web::Data::new(services.sync_service.clone()))
            .app_data(web::Data::new(jwt_keys.clone()))
            .app_data(web::Data::new(settings.clone()))
    })
    .shutdown_timeout(30)
    .listen(listener)
    .context(format!("Failed to listen on {listen_address}"))?;

    Ok(server.run())
}

/// Run the queue server: one pool per named queue, the janitor, and the
/// periodic forward sync, until `shutdown` resolves.
pub async fn run_worker(
    pool: Arc<PgPool>,
    sync_interval: Duration,
    services: &Services,
    shutdown: impl Future<Output = ()>,
) -> Result<(), OctotriageError> {
    let handler = Arc::new(TriageJobHandler::new(
        services.sync_service.clone(),
        services.rule_service.clone(),
    ));

    QueueServer::new(pool, handler)
        .register_queue(SYNC_QUEUE, SYNC_QUEUE_WORKERS)
        .register_queue(PROCESS_QUEUE, PROCESS_QUEUE_WORKERS)
        .register_queue(APPLY_RULE_QUEUE, APPLY_RULE_QUEUE_WORKERS)
        .register_periodic(PeriodicJob {
            interval: sync_interval,
            make_insert: Arc::new(|| {
                TriageJob::sync_new()
                    .to_insert()
                    .expect("SyncNew args always serialize")
            }),
            run_on_start: true,
        })
        .run(shutdown)
        .await
}
