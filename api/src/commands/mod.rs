use std::{net::TcpListener, sync::Arc};

use clap::{Parser, Subcommand};
use futures::future;
use secrecy::Secret;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::{
    configuration::Settings,
    octotriage::OctotriageError,
    run_server, run_worker, Services,
};

pub mod user;

/// octotriage API server, worker and maintenance commands
#[derive(Parser)]
#[clap(version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity
    #[clap(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the API server
    Serve {
        /// Also run the queue workers inside the server process
        #[arg(short, long)]
        embed_async_workers: bool,
    },

    /// Run the queue workers
    StartWorkers,

    /// Run one forward sync immediately and exit
    SyncNotifications,

    /// Generate a JWT_SECRET value
    GenerateJwtSecret,

    /// Manage the user account
    User {
        #[clap(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Show the configured user
    Show,
    /// Reset the user password
    ResetPassword { new_password: String },
}

impl Cli {
    pub fn service_name(&self) -> String {
        match self.command {
            Commands::StartWorkers => "octotriage-workers".to_string(),
            _ => "octotriage-api".to_string(),
        }
    }

    pub fn log_level(&self, settings: &Settings) -> (String, log::LevelFilter) {
        match self.verbose {
            1 => (log::LevelFilter::Info.to_string(), log::LevelFilter::Info),
            2 => (log::LevelFilter::Debug.to_string(), log::LevelFilter::Debug),
            _ if self.verbose > 2 => {
                (log::LevelFilter::Trace.to_string(), log::LevelFilter::Trace)
            }
            _ => (settings.log_directive.clone(), log::LevelFilter::Info),
        }
    }

    pub async fn execute(
        &self,
        settings: Settings,
        pool: Arc<PgPool>,
        services: Services,
    ) -> Result<(), OctotriageError> {
        match &self.command {
            Commands::Serve { embed_async_workers } => {
                configure_upstream_token(&settings, &services).await?;
                bootstrap_user(&services).await?;

                let listener = TcpListener::bind(settings.listen_address())
                    .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                        "Failed to bind {}: {err}",
                        settings.listen_address()
                    )))?;
                let sync_interval = settings.sync_interval;
                let server = run_server(listener, settings, services.clone())?;

                if *embed_async_workers {
                    let worker = run_worker(pool, sync_interval, &services, async {
                        let _ = tokio::signal::ctrl_c().await;
                    });
                    let (server_result, worker_result) = future::join(server, worker).await;
                    server_result
                        .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
                            "HTTP server failed: {err}"
                        )))?;
                    worker_result?;
                } else {
                    server.await.map_err(|err| {
                        OctotriageError::Unexpected(anyhow::anyhow!("HTTP server failed: {err}"))
                    })?;
                }
                Ok(())
            }

            Commands::StartWorkers => {
                configure_upstream_token(&settings, &services).await?;
                run_worker(pool, settings.sync_interval, &services, async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await
            }

            Commands::SyncNotifications => {
                configure_upstream_token(&settings, &services).await?;
                services.sync_service.sync_new().await
            }

            Commands::GenerateJwtSecret => {
                use rand::{distributions::Alphanumeric, Rng};
                let secret: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(64)
                    .map(char::from)
                    .collect();
                println!("JWT_SECRET={secret}");
                Ok(())
            }

            Commands::User { command } => match command {
                UserCommands::Show => user::show_user(&services).await,
                UserCommands::ResetPassword { new_password } => {
                    user::reset_password(&services, new_password).await
                }
            },
        }
    }
}

/// Set the upstream token from `UPSTREAM_TOKEN`, falling back to an
/// interactive prompt. A missing token leaves sync unconfigured (the
/// periodic sync is a no-op until one is provided); an invalid token is a
/// startup failure.
async fn configure_upstream_token(
    settings: &Settings,
    services: &Services,
) -> Result<(), OctotriageError> {
    if let Some(token) = settings.upstream_token.clone() {
        return services.github_service.set_token(token).await;
    }

    match rpassword::prompt_password("GitHub token (leave empty to skip): ") {
        Ok(token) if !token.trim().is_empty() => {
            services
                .github_service
                .set_token(Secret::new(token.trim().to_string()))
                .await
        }
        _ => {
            warn!("No upstream token configured, notification sync is disabled");
            Ok(())
        }
    }
}

async fn bootstrap_user(services: &Services) -> Result<(), OctotriageError> {
    let mut transaction = services.user_service.begin().await?;
    let user = services
        .user_service
        .bootstrap_default_user(&mut transaction)
        .await?;
    transaction
        .commit()
        .await
        .map_err(|err| OctotriageError::Unexpected(anyhow::anyhow!(
            "Failed to commit user bootstrap: {err}"
        )))?;
    info!("Serving user `{}`", user.username);
    Ok(())
}
