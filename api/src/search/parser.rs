use std::fmt;

use super::lexer::{tokenize, Token, TokenKind};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (at character {})", self.message, self.offset)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Ast {
    Or(Vec<Ast>),
    And(Vec<Ast>),
    Not(Box<Ast>),
    Leaf(Term),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Term {
    Is(StateFilter),
    Type(String),
    Reason(String),
    Repo(String),
    Org(String),
    Author(String),
    Tags(String),
    /// `in:anywhere` — disables the default inbox scope.
    InAnywhere,
    /// Bare word: substring match on the title.
    Title(String),
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StateFilter {
    Read,
    Unread,
    Starred,
    Archived,
    Snoozed,
    Muted,
    Filtered,
}

impl StateFilter {
    fn parse(value: &str, offset: usize) -> Result<Self, ParseError> {
        match value.to_ascii_lowercase().as_str() {
            "read" => Ok(StateFilter::Read),
            "unread" => Ok(StateFilter::Unread),
            "starred" => Ok(StateFilter::Starred),
            "archived" => Ok(StateFilter::Archived),
            "snoozed" => Ok(StateFilter::Snoozed),
            "muted" => Ok(StateFilter::Muted),
            "filtered" => Ok(StateFilter::Filtered),
            other => Err(ParseError {
                offset,
                message: format!("Unknown state `{other}` for `is:`"),
            }),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StateFilter::Read => "read",
            StateFilter::Unread => "unread",
            StateFilter::Starred => "starred",
            StateFilter::Archived => "archived",
            StateFilter::Snoozed => "snoozed",
            StateFilter::Muted => "muted",
            StateFilter::Filtered => "filtered",
        }
    }
}

impl Ast {
    /// Whether any leaf disables the default inbox scope.
    pub fn contains_in_anywhere(&self) -> bool {
        match self {
            Ast::Or(children) | Ast::And(children) => {
                children.iter().any(Ast::contains_in_anywhere)
            }
            Ast::Not(child) => child.contains_in_anywhere(),
            Ast::Leaf(term) => matches!(term, Term::InAnywhere),
        }
    }
}

/// Parse a query text. Empty or whitespace-only input parses to `None` (the
/// default inbox scope).
pub fn parse(input: &str) -> Result<Option<Ast>, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut parser = Parser { tokens, position: 0 };
    let ast = parser.parse_or()?;
    if let Some(token) = parser.peek() {
        return Err(ParseError {
            offset: token.offset,
            message: "Unexpected trailing input".to_string(),
        });
    }
    Ok(Some(ast))
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(
            self.peek(),
            Some(Token { kind: TokenKind::Term { field: None, value }, .. })
                if value.eq_ignore_ascii_case(keyword)
        )
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|t| t.offset + 1).unwrap_or(0)
    }

    fn parse_or(&mut self) -> Result<Ast, ParseError> {
        let mut children = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.advance();
            children.push(self.parse_and()?);
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Ast::Or(children)
        })
    }

    fn parse_and(&mut self) -> Result<Ast, ParseError> {
        let mut children = vec![self.parse_not()?];
        loop {
            if self.peek_keyword("and") {
                self.advance();
                children.push(self.parse_not()?);
                continue;
            }
            // Adjacency is an implicit AND.
            match self.peek() {
                Some(Token { kind: TokenKind::RParen, .. }) | None => break,
                Some(_) if self.peek_keyword("or") => break,
                Some(_) => children.push(self.parse_not()?),
            }
        }
        Ok(if children.len() == 1 {
            children.remove(0)
        } else {
            Ast::And(children)
        })
    }

    fn parse_not(&mut self) -> Result<Ast, ParseError> {
        let mut negated = false;
        loop {
            if matches!(self.peek(), Some(Token { kind: TokenKind::Minus, .. })) {
                self.advance();
                negated = !negated;
            } else if self.peek_keyword("not") {
                self.advance();
                negated = !negated;
            } else {
                break;
            }
        }
        let primary = self.parse_primary()?;
        Ok(if negated {
            Ast::Not(Box::new(primary))
        } else {
            primary
        })
    }

    fn parse_primary(&mut self) -> Result<Ast, ParseError> {
        let Some(token) = self.advance() else {
            return Err(ParseError {
                offset: self.end_offset(),
                message: "Expected an expression".to_string(),
            });
        };
        match token.kind {
            TokenKind::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token { kind: TokenKind::RParen, .. }) => Ok(inner),
                    Some(other) => Err(ParseError {
                        offset: other.offset,
                        message: "Expected `)`".to_string(),
                    }),
                    None => Err(ParseError {
                        offset: token.offset,
                        message: "Unclosed `(`".to_string(),
                    }),
                }
            }
            TokenKind::RParen => Err(ParseError {
                offset: token.offset,
                message: "Unexpected `)`".to_string(),
            }),
            TokenKind::Minus => Err(ParseError {
                offset: token.offset,
                message: "Dangling `-`".to_string(),
            }),
            TokenKind::Term { field, value } => {
                Ok(Ast::Leaf(Term::parse(field, value, token.offset)?))
            }
        }
    }
}

impl Term {
    fn parse(field: Option<String>, value: String, offset: usize) -> Result<Self, ParseError> {
        let Some(field) = field else {
            return Ok(Term::Title(value));
        };
        if value.is_empty() {
            return Err(ParseError {
                offset,
                message: format!("Missing value for field `{field}`"),
            });
        }
        match field.to_ascii_lowercase().as_str() {
            "is" => Ok(Term::Is(StateFilter::parse(&value, offset)?)),
            "type" => Ok(Term::Type(value)),
            "reason" => Ok(Term::Reason(value)),
            "repo" => Ok(Term::Repo(value)),
            "org" => Ok(Term::Org(value)),
            "author" => Ok(Term::Author(value)),
            "tags" => Ok(Term::Tags(value)),
            "in" => {
                if value.eq_ignore_ascii_case("anywhere") {
                    Ok(Term::InAnywhere)
                } else {
                    Err(ParseError {
                        offset,
                        message: format!("Unknown scope `{value}` for `in:` (expected `anywhere`)"),
                    })
                }
            }
            other => Err(ParseError {
                offset,
                message: format!("Unknown field `{other}`"),
            }),
        }
    }
}

fn write_value(f: &mut fmt::Formatter, value: &str) -> fmt::Result {
    if value.contains(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '"')) {
        write!(f, "\"{value}\"")
    } else {
        write!(f, "{value}")
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Term::Is(state) => write!(f, "is:{}", state.as_str()),
            Term::Type(value) => {
                write!(f, "type:")?;
                write_value(f, value)
            }
            Term::Reason(value) => {
                write!(f, "reason:")?;
                write_value(f, value)
            }
            Term::Repo(value) => {
                write!(f, "repo:")?;
                write_value(f, value)
            }
            Term::Org(value) => {
                write!(f, "org:")?;
                write_value(f, value)
            }
            Term::Author(value) => {
                write!(f, "author:")?;
                write_value(f, value)
            }
            Term::Tags(value) => {
                write!(f, "tags:")?;
                write_value(f, value)
            }
            Term::InAnywhere => write!(f, "in:anywhere"),
            Term::Title(value) => write_value(f, value),
        }
    }
}

/// Prints the normalized form of the query: implicit `AND`, `-` negation,
/// parentheses only where precedence requires them. Parsing the printed form
/// yields the same tree.
impl fmt::Display for Ast {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Ast::Leaf(term) => write!(f, "{term}"),
            Ast::Not(child) => match child.as_ref() {
                Ast::Leaf(term) => write!(f, "-{term}"),
                composite => write!(f, "-({composite})"),
            },
            Ast::And(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    match child {
                        Ast::Or(_) => write!(f, "({child})")?,
                        _ => write!(f, "{child}")?,
                    }
                }
                Ok(())
            }
            Ast::Or(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " OR ")?;
                    }
                    match child {
                        Ast::Or(_) => write!(f, "({child})")?,
                        _ => write!(f, "{child}")?,
                    }
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    fn leaf(term: Term) -> Ast {
        Ast::Leaf(term)
    }

    #[test]
    fn test_parse_empty_query() {
        assert_eq!(parse("").unwrap(), None);
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn test_parse_implicit_and() {
        let ast = parse("is:unread type:PullRequest").unwrap().unwrap();
        assert_eq!(
            ast,
            Ast::And(vec![
                leaf(Term::Is(StateFilter::Unread)),
                leaf(Term::Type("PullRequest".to_string())),
            ])
        );
    }

    #[test]
    fn test_parse_or_binds_looser_than_and() {
        let ast = parse("is:unread type:PullRequest OR tags:urgent").unwrap().unwrap();
        assert_eq!(
            ast,
            Ast::Or(vec![
                Ast::And(vec![
                    leaf(Term::Is(StateFilter::Unread)),
                    leaf(Term::Type("PullRequest".to_string())),
                ]),
                leaf(Term::Tags("urgent".to_string())),
            ])
        );
    }

    #[test]
    fn test_parse_parens_and_negation() {
        let ast = parse("-(is:read OR is:muted) author:dependabot").unwrap().unwrap();
        assert_eq!(
            ast,
            Ast::And(vec![
                Ast::Not(Box::new(Ast::Or(vec![
                    leaf(Term::Is(StateFilter::Read)),
                    leaf(Term::Is(StateFilter::Muted)),
                ]))),
                leaf(Term::Author("dependabot".to_string())),
            ])
        );
    }

    #[test]
    fn test_parse_not_keyword_equivalent_to_minus() {
        assert_eq!(parse("NOT is:read").unwrap(), parse("-is:read").unwrap());
        assert_eq!(parse("not not is:read").unwrap(), parse("is:read").unwrap());
    }

    #[test]
    fn test_parse_detects_in_anywhere() {
        let ast = parse("is:archived in:anywhere").unwrap().unwrap();
        assert!(ast.contains_in_anywhere());
        let ast = parse("is:unread").unwrap().unwrap();
        assert!(!ast.contains_in_anywhere());
    }

    #[rstest]
    #[case("foo:bar", 0)]
    #[case("is:later", 0)]
    #[case("in:inbox", 0)]
    #[case("(is:read", 0)]
    #[case("is:read)", 7)]
    #[case("is:read -", 9)]
    fn test_parse_errors_carry_offsets(#[case] input: &str, #[case] offset: usize) {
        let err = parse(input).unwrap_err();
        assert_eq!(err.offset, offset, "input: {input}, error: {err}");
    }

    #[rstest]
    #[case("is:unread type:PullRequest")]
    #[case("(is:unread AND type:PullRequest) OR tags:urgent")]
    #[case("-(is:read OR is:muted) author:dependabot")]
    #[case("repo:acme/* in:anywhere")]
    #[case("\"a quoted title\" org:acme")]
    fn test_parse_print_round_trip(#[case] input: &str) {
        let parsed = parse(input).unwrap().unwrap();
        let printed = parsed.to_string();
        let reparsed = parse(&printed).unwrap().unwrap();
        assert_eq!(reparsed, parsed, "printed form: {printed}");
    }
}
