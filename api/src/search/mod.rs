//! The user-facing query language: `is:unread repo:acme/widgets -tags:noise`.
//!
//! A query text is tokenized and parsed into an [`Ast`], which compiles
//! either into a parameterized SQL fragment against the notification store
//! ([`build_query`]) or into an in-memory predicate over a single fetched
//! row ([`Evaluator`]). Both produce the same boolean for the same row.

mod eval;
mod lexer;
mod parser;
mod sql;

pub use eval::Evaluator;
pub use parser::{parse, Ast, ParseError, StateFilter, Term};
pub use sql::{build_query, build_query_at, CompiledQuery, QueryArg, SqlCondition, SqlPiece};

use crate::octotriage::OctotriageError;

impl From<ParseError> for OctotriageError {
    fn from(err: ParseError) -> Self {
        OctotriageError::InvalidQuery {
            offset: err.offset,
            message: err.message,
        }
    }
}

/// Case-insensitive value matching shared by the SQL compiler and the
/// in-memory evaluator: a `*` makes the value an anchored wildcard pattern,
/// anything else is a substring match.
pub(crate) fn text_match(haystack: &str, needle: &str) -> bool {
    let haystack = haystack.to_lowercase();
    let needle = needle.to_lowercase();
    if needle.contains('*') {
        wildcard_match(&haystack, &needle)
    } else {
        haystack.contains(&needle)
    }
}

fn wildcard_match(haystack: &str, pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match segments.split_first() {
        Some(parts) => parts,
        None => return true,
    };
    if !haystack.starts_with(first) {
        return false;
    }
    let mut position = first.len();
    let (last, middle) = match rest.split_last() {
        Some(parts) => parts,
        None => return haystack.len() == first.len(),
    };
    for segment in middle {
        match haystack[position..].find(segment) {
            Some(found) => position = position + found + segment.len(),
            None => return false,
        }
    }
    haystack.len() >= position + last.len() && haystack.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case("acme/widgets", "widget", true)]
    #[case("acme/widgets", "ACME", true)]
    #[case("acme/widgets", "acme/*", true)]
    #[case("acme/widgets", "*/widgets", true)]
    #[case("acme/widgets", "a*e/w*s", true)]
    #[case("acme/widgets", "other/*", false)]
    #[case("acme/widgets", "gadgets", false)]
    #[case("acme", "acme*", true)]
    fn test_text_match(#[case] haystack: &str, #[case] needle: &str, #[case] expected: bool) {
        assert_eq!(text_match(haystack, needle), expected);
    }
}
