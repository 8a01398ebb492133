use std::{process, sync::Arc};

use clap::Parser;
use secrecy::ExposeSecret;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    ConnectOptions, Executor,
};
use tracing::{error, info};

use octotriage_api::{
    build_services, commands,
    configuration::Settings,
    observability::{get_subscriber, init_subscriber},
};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = commands::Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(1);
        }
    };

    let (log_env_filter, dep_log_level_filter) = cli.log_level(&settings);
    init_subscriber(
        get_subscriber(&cli.service_name(), &log_env_filter),
        dep_log_level_filter,
    );

    info!("Connecting to PostgreSQL on {}", settings.safe_database_url());
    let options = match settings
        .database_url
        .expose_secret()
        .parse::<PgConnectOptions>()
    {
        Ok(options) => options.log_statements(log::LevelFilter::Debug),
        Err(err) => {
            error!("Invalid DATABASE_URL: {err}");
            process::exit(1);
        }
    };
    let pool = match PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                conn.execute("SET default_transaction_isolation TO 'read committed'")
                    .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
    {
        Ok(pool) => Arc::new(pool),
        Err(err) => {
            error!("Failed to connect to PostgreSQL: {err}");
            process::exit(1);
        }
    };

    if let Err(err) = sqlx::migrate!("./migrations").run(pool.as_ref()).await {
        error!("Failed to run database migrations: {err}");
        process::exit(1);
    }

    let services = match build_services(pool.clone(), None) {
        Ok(services) => services,
        Err(err) => {
            error!("Failed to build services: {err:?}");
            process::exit(1);
        }
    };

    if let Err(err) = cli.execute(settings, pool, services).await {
        error!("octotriage failed: {err:?}");
        process::exit(1);
    }
    Ok(())
}
