use anyhow::Context;
use serde::{Deserialize, Serialize};

use octotriage::RuleId;

use crate::octotriage::{rule::service::RuleService, OctotriageError};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApplyRuleJob {
    pub rule_id: RuleId,
}

/// Retroactively apply a rule over every existing match.
pub async fn handle_apply_rule(
    event: ApplyRuleJob,
    rule_service: &RuleService,
) -> Result<(), OctotriageError> {
    let mut transaction = rule_service.begin().await?;
    rule_service
        .apply_rule(&mut transaction, event.rule_id)
        .await?;
    transaction
        .commit()
        .await
        .context("Failed to commit retroactive rule application")?;
    Ok(())
}
