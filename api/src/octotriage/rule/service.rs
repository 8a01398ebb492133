use std::sync::Arc;

use anyhow::anyhow;
use sqlx::{Postgres, Transaction};
use tracing::{info, warn};

use octotriage::{
    notification::NotificationStateChange,
    rule::{CreateRuleParameters, Rule, RuleActions, UpdateRuleParameters},
    tag::TaggableEntity,
    RuleId,
};

use crate::{
    jobs::TriageJob,
    octotriage::OctotriageError,
    queue::JobClient,
    repository::{
        notification::NotificationRepository,
        rule::{RulePatch, RuleRepository},
        tag::TagRepository,
        view::ViewRepository,
        Repository,
    },
    search,
};

/// Pages of the retroactive application loop.
const APPLY_RULE_PAGE_SIZE: usize = 100;

/// Rule CRUD plus the two evaluation paths: forward matching against a
/// single freshly-inserted notification, and retroactive application over
/// the full matching set.
pub struct RuleService {
    repository: Arc<Repository>,
    job_client: JobClient,
}

impl RuleService {
    pub fn new(repository: Arc<Repository>, job_client: JobClient) -> Self {
        RuleService {
            repository,
            job_client,
        }
    }

    pub async fn begin(&self) -> Result<Transaction<'_, Postgres>, OctotriageError> {
        self.repository.begin().await
    }

    #[tracing::instrument(level = "debug", skip_all, err)]
    pub async fn list_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
    ) -> Result<Vec<Rule>, OctotriageError> {
        self.repository.list_rules(executor, false).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn get_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        rule_id: RuleId,
    ) -> Result<Option<Rule>, OctotriageError> {
        self.repository.get_rule(executor, rule_id).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), fields(name = parameters.name), err)]
    pub async fn create_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        parameters: &CreateRuleParameters,
    ) -> Result<Rule, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;
        let query = normalize_query(parameters.query.clone());
        self.validate_rule_predicate(executor, &query, parameters.view_id.map(Into::into))
            .await?;

        self.repository
            .create_rule(
                executor,
                &parameters.name,
                query,
                parameters.view_id,
                &parameters.actions,
            )
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, executor, parameters), err)]
    pub async fn update_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        rule_id: RuleId,
        parameters: &UpdateRuleParameters,
    ) -> Result<Rule, OctotriageError> {
        validator::Validate::validate(parameters).map_err(OctotriageError::InvalidParameters)?;

        let existing = self
            .repository
            .get_rule(executor, rule_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("rule {rule_id}")))?;

        let query = match &parameters.query {
            Some(query) => normalize_query(Some(query.clone())),
            None => existing.query.clone(),
        };
        let view_id = match &parameters.view_id {
            Some(view_id) => *view_id,
            None => existing.view_id,
        };
        self.validate_rule_predicate(executor, &query, view_id).await?;

        let patch = RulePatch {
            name: parameters.name.clone(),
            enabled: parameters.enabled,
            query: parameters.query.as_ref().map(|_| query),
            view_id: parameters.view_id.as_ref().map(|_| view_id),
            actions: parameters.actions.clone(),
        };
        self.repository.update_rule(executor, rule_id, &patch).await
    }

    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn delete_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        rule_id: RuleId,
    ) -> Result<(), OctotriageError> {
        self.repository.delete_rule(executor, rule_id).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(count = ordered_ids.len()), err)]
    pub async fn reorder_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        ordered_ids: &[RuleId],
    ) -> Result<(), OctotriageError> {
        self.repository.reorder_rules(executor, ordered_ids).await
    }

    /// Enqueue retroactive application; used by rule creation with
    /// `applyToExisting` and by the explicit apply endpoint.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn enqueue_apply_rule(&self, rule_id: RuleId) -> Result<(), OctotriageError> {
        let insert = TriageJob::apply_rule(rule_id).to_insert()?;
        self.job_client.insert(&insert).await?;
        Ok(())
    }

    /// Forward matching: test a stored notification against every enabled
    /// rule in display order and apply the actions of each match. A broken
    /// or failing rule never blocks the remaining ones. Returns whether any
    /// rule matched.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn match_and_apply_rules(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
    ) -> Result<bool, OctotriageError> {
        let notification = self
            .repository
            .get_notification_for_github_id(executor, github_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?;

        let rules = self.repository.list_rules(executor, true).await?;
        let mut any_matched = false;

        for rule in rules {
            let Some(query) = self.effective_query(executor, &rule).await? else {
                continue;
            };
            let compiled = match search::build_query(&query, 1, 0) {
                Ok(compiled) => compiled,
                Err(err) => {
                    warn!("Rule `{}` has an unparseable query, skipping: {err}", rule.name);
                    continue;
                }
            };
            let matched = match self
                .repository
                .notification_matches_query(executor, &compiled, notification.id)
                .await
            {
                Ok(matched) => matched,
                Err(err) => {
                    warn!("Rule `{}` failed to evaluate, skipping: {err:?}", rule.name);
                    continue;
                }
            };
            if !matched {
                continue;
            }

            any_matched = true;
            if let Err(err) = self
                .apply_rule_actions(executor, github_id, &rule.actions)
                .await
            {
                warn!(
                    "Rule `{}` matched notification {github_id} but some actions failed: {err:?}",
                    rule.name
                );
            }
        }

        Ok(any_matched)
    }

    /// Apply a rule's declarative actions to one notification, each step
    /// independently. Failures are accumulated into one combined error;
    /// the executor never short-circuits.
    #[tracing::instrument(level = "debug", skip(self, executor, actions), err)]
    pub async fn apply_rule_actions(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        github_id: &str,
        actions: &RuleActions,
    ) -> Result<(), OctotriageError> {
        let notification = self
            .repository
            .get_notification_for_github_id(executor, github_id)
            .await?
            .ok_or_else(|| OctotriageError::ItemNotFound(format!("notification {github_id}")))?;

        let mut failures: Vec<String> = Vec::new();

        let state_changes = [
            (actions.skip_inbox, NotificationStateChange::MarkFiltered),
            (actions.mark_read, NotificationStateChange::MarkRead),
            (actions.star, NotificationStateChange::Star),
            (actions.archive, NotificationStateChange::Archive),
            (actions.mute, NotificationStateChange::Mute),
        ];
        for (requested, change) in state_changes {
            if !requested {
                continue;
            }
            if let Err(err) = self
                .repository
                .set_notification_state(executor, github_id, change)
                .await
            {
                failures.push(format!("{change:?}: {err}"));
            }
        }

        let entity_type = TaggableEntity::Notification.as_entity_type();
        for tag_id in &actions.assign_tags {
            match self.repository.get_tag(executor, *tag_id).await {
                Ok(Some(_)) => {
                    if let Err(err) = self
                        .repository
                        .assign_tag_to_entity(executor, *tag_id, entity_type, notification.id.0)
                        .await
                    {
                        failures.push(format!("assign tag {tag_id}: {err}"));
                    }
                }
                Ok(None) => failures.push(format!("assign tag {tag_id}: tag does not exist")),
                Err(err) => failures.push(format!("assign tag {tag_id}: {err}")),
            }
        }
        for tag_id in &actions.remove_tags {
            if let Err(err) = self
                .repository
                .remove_tag_assignment(executor, *tag_id, entity_type, notification.id.0)
                .await
            {
                failures.push(format!("remove tag {tag_id}: {err}"));
            }
        }
        if !actions.assign_tags.is_empty() || !actions.remove_tags.is_empty() {
            if let Err(err) = self
                .repository
                .update_notification_tag_ids(executor, notification.id)
                .await
            {
                failures.push(format!("recompute tag_ids: {err}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OctotriageError::Unexpected(anyhow!(
                "Rule actions partially failed for notification {github_id}: {}",
                failures.join("; ")
            )))
        }
    }

    /// Retroactive application: run the rule's actions over every existing
    /// match, in pages, able to touch filtered and archived items. A
    /// notification whose actions partially fail is skipped; iteration
    /// terminates on an empty page or once the first page's total has been
    /// processed.
    #[tracing::instrument(level = "debug", skip(self, executor), err)]
    pub async fn apply_rule(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        rule_id: RuleId,
    ) -> Result<(), OctotriageError> {
        let Some(rule) = self.repository.get_rule(executor, rule_id).await? else {
            warn!("Rule {rule_id} no longer exists, nothing to apply");
            return Ok(());
        };
        if !rule.enabled {
            info!("Rule `{}` is disabled, skipping retroactive application", rule.name);
            return Ok(());
        }
        let Some(query) = self.effective_query(executor, &rule).await? else {
            return Ok(());
        };
        let wrapped = format!("({query}) in:anywhere");

        let mut offset = 0;
        let mut processed = 0;
        let mut first_page_total: Option<usize> = None;
        loop {
            let compiled = search::build_query(&wrapped, APPLY_RULE_PAGE_SIZE, offset)?;
            let page = self
                .repository
                .list_notifications_from_query(executor, &compiled)
                .await?;
            let total = *first_page_total.get_or_insert(page.total);
            if page.content.is_empty() {
                break;
            }

            for notification in &page.content {
                if let Err(err) = self
                    .apply_rule_actions(executor, &notification.github_id, &rule.actions)
                    .await
                {
                    warn!(
                        "Skipping notification {} during retroactive application of `{}`: {err:?}",
                        notification.github_id, rule.name
                    );
                }
                processed += 1;
            }
            offset += page.content.len();
            if processed >= total {
                break;
            }
        }
        info!(
            "Applied rule `{}` to {processed} existing notifications",
            rule.name
        );

        Ok(())
    }

    /// The predicate a rule evaluates with: its view's query when a view is
    /// referenced (the documented tie-break), its own query otherwise. A
    /// rule with neither is broken: warn and skip, never a hard failure.
    async fn effective_query(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        rule: &Rule,
    ) -> Result<Option<String>, OctotriageError> {
        if let Some(view_id) = rule.view_id {
            match self.repository.get_view(executor, view_id).await? {
                Some(view) => match view.query {
                    Some(query) if !query.trim().is_empty() => return Ok(Some(query)),
                    _ => {
                        warn!(
                            "Rule `{}` references view {view_id} which has no query, skipping",
                            rule.name
                        );
                        return Ok(None);
                    }
                },
                None => {
                    warn!(
                        "Rule `{}` references deleted view {view_id}, skipping",
                        rule.name
                    );
                    return Ok(None);
                }
            }
        }
        match &rule.query {
            Some(query) if !query.trim().is_empty() => Ok(Some(query.clone())),
            _ => {
                warn!("Rule `{}` has neither a query nor a view, skipping", rule.name);
                Ok(None)
            }
        }
    }

    async fn validate_rule_predicate(
        &self,
        executor: &mut Transaction<'_, Postgres>,
        query: &Option<String>,
        view_id: Option<octotriage::ViewId>,
    ) -> Result<(), OctotriageError> {
        if query.is_none() && view_id.is_none() {
            return Err(OctotriageError::InvalidInputData {
                source: None,
                user_error: "A rule needs a query or a view".to_string(),
            });
        }
        if let Some(query) = query {
            search::parse(query)?;
        }
        if let Some(view_id) = view_id {
            self.repository
                .get_view(executor, view_id)
                .await?
                .ok_or_else(|| OctotriageError::InvalidInputData {
                    source: None,
                    user_error: format!("View {view_id} does not exist"),
                })?;
        }
        Ok(())
    }
}

fn normalize_query(query: Option<String>) -> Option<String> {
    query.filter(|q| !q.trim().is_empty())
}
