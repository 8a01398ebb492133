use anyhow::Context;

use crate::{octotriage::OctotriageError, Services};

pub async fn show_user(services: &Services) -> Result<(), OctotriageError> {
    let mut transaction = services.user_service.begin().await?;
    let user = services.user_service.get_user(&mut transaction).await?;
    println!("{} (created {})", user.username, user.created_at);
    println!(
        "setup completed: {}",
        user.sync_settings.setup_completed
    );
    Ok(())
}

pub async fn reset_password(
    services: &Services,
    new_password: &str,
) -> Result<(), OctotriageError> {
    let mut transaction = services.user_service.begin().await?;
    let user = services
        .user_service
        .reset_password(&mut transaction, new_password)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit password reset")?;
    println!("Password updated for `{}`", user.username);
    Ok(())
}
