use std::sync::Arc;

use anyhow::anyhow;
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash as Argon2Hash, SaltString},
    Argon2, PasswordHasher, PasswordVerifier,
};
use rand::{distributions::Alphanumeric, Rng};
use secrecy::{ExposeSecret, Secret};
use sqlx::{Postgres, Transaction};
use tracing::info;

use octotriage::user::{
    validate_username, Credentials, PasswordHash, SyncSettings, UpdateCredentialsParameters,
    UpdateSyncSettingsParameters, User,
};

use crate::{
    octotriage::OctotriageError,
    repository::{user::UserRepository, Repository},
};

const DEFAULT_USERNAME: &str = "admin";

/// The single principal: bootstrap, login, credential and sync-settings
/// management.
pub struct UserService {
    repository: Arc<Repository>,
    /// Hash verified when the presented username matches no user, so that
    /// login duration does not reveal whether the account exists.
    dummy_password_hash: String,
}

impl UserService {
    pub fn new(repository: Arc<Repository>) -> Result<Self, OctotriageError> {
        let dummy_password_hash = hash_password("timing-equalizer")?;
        Ok(UserService {
            repository,
            dummy_password_hash,
        })
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn get_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<User, OctotriageError> {
        self.repository
            .get_user(executor)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound("user".to_string()))
    }

    /// Create the default user on first start; later starts are a no-op.
    /// The generated password is printed once so the operator can log in.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn bootstrap_default_user(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<User, OctotriageError> {
        if let Some(user) = self.repository.get_user(executor).await? {
            return Ok(user);
        }

        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(20)
            .map(char::from)
            .collect();
        let password_hash = Secret::new(PasswordHash(hash_password(&password)?));
        let user = self
            .repository
            .create_user(
                executor,
                DEFAULT_USERNAME,
                password_hash,
                &SyncSettings::default(),
            )
            .await?;
        info!("Created default user `{DEFAULT_USERNAME}` with password: {password}");
        Ok(user)
    }

    /// The hash comparison runs even when the username is wrong, to avoid a
    /// timing oracle on account existence.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn login(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        credentials: &Credentials,
    ) -> Result<User, OctotriageError> {
        let user = self.repository.get_user(executor).await?;
        let (stored_hash, username_matches) = match &user {
            Some(user) if user.username == credentials.username => {
                (user.password_hash.expose_secret().0.clone(), true)
            }
            _ => (self.dummy_password_hash.clone(), false),
        };

        let password_matches =
            verify_password(credentials.password.expose_secret().0.as_str(), &stored_hash);
        if username_matches && password_matches {
            Ok(user.expect("username matched a stored user"))
        } else {
            Err(OctotriageError::Unauthorized(anyhow!(
                "Invalid username or password"
            )))
        }
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn update_credentials(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &UpdateCredentialsParameters,
    ) -> Result<User, OctotriageError> {
        let user = self.get_user(executor).await?;
        if !verify_password(
            parameters.current_password.expose_secret().0.as_str(),
            &user.password_hash.expose_secret().0,
        ) {
            return Err(OctotriageError::Unauthorized(anyhow!(
                "Current password does not match"
            )));
        }

        let username = match &parameters.username {
            Some(username) => {
                validate_username(username).map_err(|err| OctotriageError::InvalidInputData {
                    source: None,
                    user_error: err.to_string(),
                })?;
                username.clone()
            }
            None => user.username.clone(),
        };
        let password_hash = match &parameters.new_password {
            Some(password) => {
                // Re-parse to apply the minimum-length policy.
                let password: octotriage::user::Password = password
                    .expose_secret()
                    .0
                    .parse()
                    .map_err(|err: anyhow::Error| OctotriageError::InvalidInputData {
                        source: None,
                        user_error: err.to_string(),
                    })?;
                Secret::new(PasswordHash(hash_password(&password.0)?))
            }
            None => user.password_hash.clone(),
        };

        self.repository
            .update_user_credentials(executor, &username, password_hash)
            .await
    }

    /// Operator password reset from the CLI; no current-password check.
    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn reset_password(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        new_password: &str,
    ) -> Result<User, OctotriageError> {
        let user = self.get_user(executor).await?;
        let password: octotriage::user::Password = new_password
            .parse()
            .map_err(|err: anyhow::Error| OctotriageError::InvalidInputData {
                source: None,
                user_error: err.to_string(),
            })?;
        let password_hash = Secret::new(PasswordHash(hash_password(&password.0)?));
        self.repository
            .update_user_credentials(executor, &user.username, password_hash)
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn get_sync_settings(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<SyncSettings, OctotriageError> {
        Ok(self.get_user(executor).await?.sync_settings)
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn update_sync_settings(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &UpdateSyncSettingsParameters,
    ) -> Result<SyncSettings, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;
        let sync_settings = SyncSettings {
            initial_sync_days: parameters.initial_sync_days,
            initial_sync_max_count: parameters.initial_sync_max_count,
            initial_sync_unread_only: parameters.initial_sync_unread_only,
            setup_completed: parameters.setup_completed,
        };
        let user = self
            .repository
            .update_sync_settings(executor, &sync_settings)
            .await?;
        Ok(user.sync_settings)
    }
}

pub fn hash_password(password: &str) -> Result<String, OctotriageError> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("Failed to hash password: {err}"))?
        .to_string())
}

pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = Argon2Hash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_round_trip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        let first = hash_password("same password").unwrap();
        let second = hash_password("same password").unwrap();
        assert_ne!(first, second);
    }
}
