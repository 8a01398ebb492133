use super::parser::ParseError;

#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Character offset of the token start, reported in parse errors.
    pub offset: usize,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub(crate) enum TokenKind {
    LParen,
    RParen,
    Minus,
    /// `field:value`, a bare word, or a quoted string.
    Term {
        field: Option<String>,
        value: String,
    },
}

pub(crate) fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut position = 0;

    while position < chars.len() {
        let offset = position;
        match chars[position] {
            c if c.is_whitespace() => {
                position += 1;
            }
            '(' => {
                tokens.push(Token { kind: TokenKind::LParen, offset });
                position += 1;
            }
            ')' => {
                tokens.push(Token { kind: TokenKind::RParen, offset });
                position += 1;
            }
            '-' => {
                tokens.push(Token { kind: TokenKind::Minus, offset });
                position += 1;
            }
            '"' => {
                let (value, next) = read_quoted(&chars, position)?;
                tokens.push(Token {
                    kind: TokenKind::Term { field: None, value },
                    offset,
                });
                position = next;
            }
            _ => {
                let (word, next) = read_word(&chars, position);
                position = next;
                match word.split_once(':') {
                    Some((field, value)) if !field.is_empty() => {
                        let value = if value.is_empty() {
                            // `field:"quoted value"`
                            if position < chars.len() && chars[position] == '"' {
                                let (value, next) = read_quoted(&chars, position)?;
                                position = next;
                                value
                            } else {
                                return Err(ParseError {
                                    offset,
                                    message: format!("Missing value for field `{field}`"),
                                });
                            }
                        } else {
                            value.to_string()
                        };
                        tokens.push(Token {
                            kind: TokenKind::Term {
                                field: Some(field.to_string()),
                                value,
                            },
                            offset,
                        });
                    }
                    _ => {
                        tokens.push(Token {
                            kind: TokenKind::Term { field: None, value: word },
                            offset,
                        });
                    }
                }
            }
        }
    }

    Ok(tokens)
}

fn read_word(chars: &[char], start: usize) -> (String, usize) {
    let mut position = start;
    let mut word = String::new();
    while position < chars.len() {
        let c = chars[position];
        if c.is_whitespace() || matches!(c, '(' | ')' | '"') {
            break;
        }
        word.push(c);
        position += 1;
    }
    (word, position)
}

fn read_quoted(chars: &[char], start: usize) -> Result<(String, usize), ParseError> {
    let mut position = start + 1;
    let mut value = String::new();
    while position < chars.len() {
        match chars[position] {
            '"' => return Ok((value, position + 1)),
            c => {
                value.push(c);
                position += 1;
            }
        }
    }
    Err(ParseError {
        offset: start,
        message: "Unterminated quoted string".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn term(field: Option<&str>, value: &str, offset: usize) -> Token {
        Token {
            kind: TokenKind::Term {
                field: field.map(String::from),
                value: value.to_string(),
            },
            offset,
        }
    }

    #[test]
    fn test_tokenize_fields_and_words() {
        let tokens = tokenize("is:unread repo:acme/widgets urgent").unwrap();
        assert_eq!(
            tokens,
            vec![
                term(Some("is"), "unread", 0),
                term(Some("repo"), "acme/widgets", 10),
                term(None, "urgent", 28),
            ]
        );
    }

    #[test]
    fn test_tokenize_parens_and_negation() {
        let tokens = tokenize("-(is:read OR is:muted)").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token { kind: TokenKind::Minus, offset: 0 },
                Token { kind: TokenKind::LParen, offset: 1 },
                term(Some("is"), "read", 2),
                term(None, "OR", 10),
                term(Some("is"), "muted", 13),
                Token { kind: TokenKind::RParen, offset: 21 },
            ]
        );
    }

    #[test]
    fn test_tokenize_quoted_values() {
        let tokens = tokenize(r#"tags:"needs review" "bare phrase""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                term(Some("tags"), "needs review", 0),
                term(None, "bare phrase", 20),
            ]
        );
    }

    #[test]
    fn test_tokenize_reports_unterminated_quote_offset() {
        let err = tokenize(r#"is:unread "oops"#).unwrap_err();
        assert_eq!(err.offset, 10);
    }

    #[test]
    fn test_tokenize_reports_missing_field_value() {
        let err = tokenize("repo: urgent").unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.message.contains("repo"));
    }
}
