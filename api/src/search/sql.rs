use chrono::{DateTime, Utc};

use super::parser::{parse, Ast, ParseError, StateFilter, Term};

/// A typed positional argument bound through `QueryBuilder::push_bind`.
/// Binding happens strictly in piece order, so argument numbering is
/// deterministic for a given query text.
#[derive(Debug, PartialEq, Clone)]
pub enum QueryArg {
    Text(String),
    Bool(bool),
    Time(DateTime<Utc>),
}

#[derive(Debug, PartialEq, Clone)]
pub enum SqlPiece {
    Sql(String),
    Bind(QueryArg),
}

/// One parenthesized `WHERE` conjunct.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct SqlCondition(pub Vec<SqlPiece>);

impl SqlCondition {
    fn sql(&mut self, sql: impl Into<String>) -> &mut Self {
        self.0.push(SqlPiece::Sql(sql.into()));
        self
    }

    fn bind(&mut self, arg: QueryArg) -> &mut Self {
        self.0.push(SqlPiece::Bind(arg));
        self
    }

    pub fn args(&self) -> Vec<&QueryArg> {
        self.0
            .iter()
            .filter_map(|piece| match piece {
                SqlPiece::Bind(arg) => Some(arg),
                SqlPiece::Sql(_) => None,
            })
            .collect()
    }
}

/// Compiled form of a query text, executed by the notification store against
/// `notification n JOIN repository r`.
#[derive(Debug, PartialEq, Clone)]
pub struct CompiledQuery {
    /// Original text, for diagnostics and re-evaluation.
    pub text: String,
    /// Joined with `AND`; each condition is self-parenthesized.
    pub conditions: Vec<SqlCondition>,
    pub order_by: String,
    pub limit: usize,
    pub offset: usize,
}

impl CompiledQuery {
    pub fn args(&self) -> Vec<&QueryArg> {
        self.conditions.iter().flat_map(|c| c.args()).collect()
    }
}

/// Compile a query text into SQL conditions. The default inbox scope is
/// appended unless `in:anywhere` appears anywhere in the tree. The `now`
/// bound for snooze comparisons is captured at compile time.
pub fn build_query(text: &str, limit: usize, offset: usize) -> Result<CompiledQuery, ParseError> {
    build_query_at(text, limit, offset, Utc::now())
}

pub fn build_query_at(
    text: &str,
    limit: usize,
    offset: usize,
    now: DateTime<Utc>,
) -> Result<CompiledQuery, ParseError> {
    let ast = parse(text)?;
    let mut conditions = Vec::new();

    if let Some(ref ast) = ast {
        let mut condition = SqlCondition::default();
        compile_expr(ast, &mut condition, now);
        conditions.push(condition);
    }

    let in_anywhere = ast
        .as_ref()
        .map(Ast::contains_in_anywhere)
        .unwrap_or(false);
    if !in_anywhere {
        conditions.push(default_scope_condition(now));
    }

    Ok(CompiledQuery {
        text: text.to_string(),
        conditions,
        order_by: "n.effective_sort_date DESC, n.id DESC".to_string(),
        limit,
        offset,
    })
}

/// `NOT archived AND NOT muted AND not currently snoozed AND NOT filtered`.
fn default_scope_condition(now: DateTime<Utc>) -> SqlCondition {
    let mut condition = SqlCondition::default();
    condition
        .sql("(n.archived = FALSE AND n.muted = FALSE AND n.filtered = FALSE AND (n.snoozed_until IS NULL OR n.snoozed_until <= ")
        .bind(QueryArg::Time(now))
        .sql("))");
    condition
}

fn compile_expr(ast: &Ast, out: &mut SqlCondition, now: DateTime<Utc>) {
    match ast {
        Ast::Or(children) => {
            out.sql("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.sql(" OR ");
                }
                compile_expr(child, out, now);
            }
            out.sql(")");
        }
        Ast::And(children) => {
            out.sql("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    out.sql(" AND ");
                }
                compile_expr(child, out, now);
            }
            out.sql(")");
        }
        Ast::Not(child) => {
            out.sql("(NOT ");
            compile_expr(child, out, now);
            out.sql(")");
        }
        Ast::Leaf(term) => compile_term(term, out, now),
    }
}

fn compile_term(term: &Term, out: &mut SqlCondition, now: DateTime<Utc>) {
    match term {
        Term::Is(StateFilter::Read) => {
            out.sql("n.unread = FALSE");
        }
        Term::Is(StateFilter::Unread) => {
            out.sql("n.unread = TRUE");
        }
        Term::Is(StateFilter::Starred) => {
            out.sql("n.starred = TRUE");
        }
        Term::Is(StateFilter::Archived) => {
            out.sql("n.archived = TRUE");
        }
        Term::Is(StateFilter::Muted) => {
            out.sql("n.muted = TRUE");
        }
        Term::Is(StateFilter::Filtered) => {
            out.sql("n.filtered = TRUE");
        }
        Term::Is(StateFilter::Snoozed) => {
            out.sql("(n.snoozed_until IS NOT NULL AND n.snoozed_until > ")
                .bind(QueryArg::Time(now))
                .sql(")");
        }
        Term::Type(value) => {
            out.sql("LOWER(n.subject_type) = LOWER(")
                .bind(QueryArg::Text(value.clone()))
                .sql(")");
        }
        Term::Reason(value) => {
            out.sql("n.reason = ").bind(QueryArg::Text(value.clone()));
        }
        Term::Repo(value) => {
            out.sql("r.full_name ILIKE ")
                .bind(QueryArg::Text(like_pattern(value)));
        }
        Term::Org(value) => {
            out.sql("split_part(r.full_name, '/', 1) ILIKE ")
                .bind(QueryArg::Text(like_pattern(value)));
        }
        Term::Author(value) => {
            out.sql("n.author_login ILIKE ")
                .bind(QueryArg::Text(like_pattern(value)));
        }
        Term::Tags(value) => {
            out.sql("EXISTS (SELECT 1 FROM tag WHERE tag.id = ANY(n.tag_ids) AND tag.slug ILIKE ")
                .bind(QueryArg::Text(like_pattern(value)))
                .sql(")");
        }
        Term::InAnywhere => {
            out.sql("TRUE");
        }
        Term::Title(value) => {
            out.sql("n.title ILIKE ")
                .bind(QueryArg::Text(like_pattern(value)));
        }
    }
}

/// Values without `*` become substring patterns, values with `*` anchored
/// wildcard patterns. `%`, `_` and `\` in the value are escaped.
fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    let mut has_wildcard = false;
    for c in value.chars() {
        match c {
            '*' => {
                has_wildcard = true;
                escaped.push('%');
            }
            '%' | '_' | '\\' => {
                escaped.push('\\');
                escaped.push(c);
            }
            _ => escaped.push(c),
        }
    }
    if has_wildcard {
        escaped
    } else {
        format!("%{escaped}%")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn render(query: &CompiledQuery) -> String {
        query
            .conditions
            .iter()
            .map(|condition| {
                condition
                    .0
                    .iter()
                    .map(|piece| match piece {
                        SqlPiece::Sql(sql) => sql.clone(),
                        SqlPiece::Bind(_) => "?".to_string(),
                    })
                    .collect::<String>()
            })
            .collect::<Vec<String>>()
            .join(" AND ")
    }

    #[test]
    fn test_empty_query_compiles_to_default_scope() {
        let query = build_query("", 50, 0).unwrap();
        assert_eq!(query.conditions.len(), 1);
        let rendered = render(&query);
        assert!(rendered.contains("n.archived = FALSE"));
        assert!(rendered.contains("n.snoozed_until IS NULL OR n.snoozed_until <= ?"));
        assert_eq!(query.args().len(), 1);
        assert_eq!(query.limit, 50);
    }

    #[test]
    fn test_in_anywhere_disables_default_scope() {
        let query = build_query("in:anywhere", 50, 0).unwrap();
        assert_eq!(render(&query), "TRUE");
        assert!(query.args().is_empty());
    }

    #[test]
    fn test_compound_query_shape_and_argument_order() {
        let query =
            build_query("(is:unread AND type:PullRequest) OR tags:urgent", 50, 0).unwrap();
        // Expression condition + default scope condition.
        assert_eq!(query.conditions.len(), 2);
        assert_eq!(
            render(&query),
            "((n.unread = TRUE AND LOWER(n.subject_type) = LOWER(?)) OR \
             EXISTS (SELECT 1 FROM tag WHERE tag.id = ANY(n.tag_ids) AND tag.slug ILIKE ?)) \
             AND (n.archived = FALSE AND n.muted = FALSE AND n.filtered = FALSE \
             AND (n.snoozed_until IS NULL OR n.snoozed_until <= ?))"
        );
        // Two positional text arguments (type, tag slug) then the scope bound.
        let args = query.args();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], &QueryArg::Text("PullRequest".to_string()));
        assert_eq!(args[1], &QueryArg::Text("%urgent%".to_string()));
        assert!(matches!(args[2], QueryArg::Time(_)));
    }

    #[test]
    fn test_negation_compiles_to_not() {
        let query = build_query("-is:read in:anywhere", 50, 0).unwrap();
        assert_eq!(render(&query), "((NOT n.unread = FALSE) AND TRUE)");
    }

    #[rstest]
    #[case("acme", "%acme%")]
    #[case("acme/*", "acme/%")]
    #[case("50%_done", "%50\\%\\_done%")]
    fn test_like_pattern(#[case] value: &str, #[case] expected: &str) {
        assert_eq!(like_pattern(value), expected);
    }

    #[test]
    fn test_malformed_query_reports_offset() {
        let err = build_query("is:unread foo:bar", 50, 0).unwrap_err();
        assert_eq!(err.offset, 10);
    }
}
