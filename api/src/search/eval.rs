use chrono::{DateTime, Utc};

use octotriage::{notification::Notification, repo::Repo, tag::Tag};

use super::{
    parser::{parse, Ast, ParseError, StateFilter, Term},
    text_match,
};

/// Row-level predicate over a notification already in hand. Produces the
/// same boolean the compiled SQL would for that row; used by the rule engine
/// and by response enrichment.
#[derive(Debug, Clone)]
pub struct Evaluator {
    ast: Option<Ast>,
    apply_default_scope: bool,
}

impl Evaluator {
    pub fn new(text: &str) -> Result<Self, ParseError> {
        let ast = parse(text)?;
        let apply_default_scope = !ast
            .as_ref()
            .map(Ast::contains_in_anywhere)
            .unwrap_or(false);
        Ok(Evaluator { ast, apply_default_scope })
    }

    pub fn matches(&self, notification: &Notification, repository: &Repo, tags: &[Tag]) -> bool {
        self.matches_at(notification, repository, tags, Utc::now())
    }

    pub fn matches_at(
        &self,
        notification: &Notification,
        repository: &Repo,
        tags: &[Tag],
        now: DateTime<Utc>,
    ) -> bool {
        if self.apply_default_scope && !notification.is_in_inbox(now) {
            return false;
        }
        match &self.ast {
            Some(ast) => eval_expr(ast, notification, repository, tags, now),
            None => true,
        }
    }
}

fn eval_expr(
    ast: &Ast,
    notification: &Notification,
    repository: &Repo,
    tags: &[Tag],
    now: DateTime<Utc>,
) -> bool {
    match ast {
        Ast::Or(children) => children
            .iter()
            .any(|child| eval_expr(child, notification, repository, tags, now)),
        Ast::And(children) => children
            .iter()
            .all(|child| eval_expr(child, notification, repository, tags, now)),
        Ast::Not(child) => !eval_expr(child, notification, repository, tags, now),
        Ast::Leaf(term) => eval_term(term, notification, repository, tags, now),
    }
}

fn eval_term(
    term: &Term,
    notification: &Notification,
    repository: &Repo,
    tags: &[Tag],
    now: DateTime<Utc>,
) -> bool {
    match term {
        Term::Is(StateFilter::Read) => !notification.unread,
        Term::Is(StateFilter::Unread) => notification.unread,
        Term::Is(StateFilter::Starred) => notification.starred,
        Term::Is(StateFilter::Archived) => notification.archived,
        Term::Is(StateFilter::Muted) => notification.muted,
        Term::Is(StateFilter::Filtered) => notification.filtered,
        Term::Is(StateFilter::Snoozed) => notification.is_snoozed(now),
        Term::Type(value) => notification
            .subject_type
            .to_string()
            .eq_ignore_ascii_case(value),
        Term::Reason(value) => notification.reason == *value,
        Term::Repo(value) => text_match(&repository.full_name, value),
        Term::Org(value) => text_match(repository.owner(), value),
        Term::Author(value) => notification
            .author_login
            .as_deref()
            .map(|login| text_match(login, value))
            .unwrap_or(false),
        Term::Tags(value) => tags
            .iter()
            .filter(|tag| notification.tag_ids.contains(&tag.id))
            .any(|tag| text_match(&tag.slug, value)),
        Term::InAnywhere => true,
        Term::Title(value) => text_match(&notification.title, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use octotriage::{notification::SubjectType, NotificationId, RepoId, TagId};
    use rstest::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn repository() -> Repo {
        Repo {
            id: RepoId(99),
            full_name: "acme/widgets".to_string(),
            name: "widgets".to_string(),
            private: false,
            description: None,
            owner_avatar_url: None,
        }
    }

    fn notification() -> Notification {
        Notification {
            id: NotificationId(1),
            github_id: "123".to_string(),
            repository_id: RepoId(99),
            pull_request_id: None,
            title: "Bump serde from 1.0.1 to 1.0.2".to_string(),
            subject_type: SubjectType::PullRequest,
            subject_url: None,
            subject_raw: None,
            reason: "review_requested".to_string(),
            author_login: Some("dependabot".to_string()),
            author_id: Some(27856297),
            updated_at: now(),
            last_read_at: None,
            snoozed_until: None,
            effective_sort_date: now(),
            unread: true,
            archived: false,
            muted: false,
            starred: false,
            filtered: false,
            tag_ids: vec![TagId(1)],
        }
    }

    fn tags() -> Vec<Tag> {
        vec![
            Tag {
                id: TagId(1),
                name: "Urgent".to_string(),
                slug: "urgent".to_string(),
                color: None,
                description: None,
                display_order: 0,
            },
            Tag {
                id: TagId(2),
                name: "Noise".to_string(),
                slug: "noise".to_string(),
                color: None,
                description: None,
                display_order: 1,
            },
        ]
    }

    #[rstest]
    #[case("", true)]
    #[case("is:unread", true)]
    #[case("is:read", false)]
    #[case("type:pullrequest", true)]
    #[case("type:Issue", false)]
    #[case("reason:review_requested", true)]
    #[case("reason:mention", false)]
    #[case("repo:widgets", true)]
    #[case("repo:acme/*", true)]
    #[case("org:acme", true)]
    #[case("org:other", false)]
    #[case("author:dependabot", true)]
    #[case("tags:urgent", true)]
    // Tag 2 exists but is not assigned to the notification.
    #[case("tags:noise", false)]
    #[case("serde", true)]
    #[case("tokio", false)]
    #[case("is:unread author:dependabot OR tags:noise", true)]
    #[case("-author:dependabot", false)]
    fn test_evaluator_matches(#[case] query: &str, #[case] expected: bool) {
        let evaluator = Evaluator::new(query).unwrap();
        assert_eq!(
            evaluator.matches_at(&notification(), &repository(), &tags(), now()),
            expected,
            "query: {query}"
        );
    }

    #[test]
    fn test_default_scope_excludes_filtered_unless_anywhere() {
        let mut filtered = notification();
        filtered.filtered = true;

        let inbox = Evaluator::new("author:dependabot").unwrap();
        assert!(!inbox.matches_at(&filtered, &repository(), &tags(), now()));

        let anywhere = Evaluator::new("author:dependabot in:anywhere").unwrap();
        assert!(anywhere.matches_at(&filtered, &repository(), &tags(), now()));
    }

    #[test]
    fn test_expired_snooze_is_back_in_scope() {
        let mut snoozed = notification();
        snoozed.snoozed_until = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let evaluator = Evaluator::new("is:unread").unwrap();
        assert!(evaluator.matches_at(&snoozed, &repository(), &tags(), now()));

        snoozed.snoozed_until = Some(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());
        assert!(!evaluator.matches_at(&snoozed, &repository(), &tags(), now()));
        let snoozed_view = Evaluator::new("is:snoozed in:anywhere").unwrap();
        assert!(snoozed_view.matches_at(&snoozed, &repository(), &tags(), now()));
    }
}
