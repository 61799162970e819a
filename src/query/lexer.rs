use super::QueryError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token's first character in the input.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    LParen,
    RParen,
    Colon,
    Comma,
    Not,
    And,
    Or,
    Value { text: String, quoted: bool },
    Eof,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | '/' | '.' | '@' | '[' | ']')
}

/// Tokenizes a query string. Errors carry the byte offset of the offending
/// character.
pub fn lex(input: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::LParen, offset });
            }
            ')' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::RParen, offset });
            }
            ':' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Colon, offset });
            }
            ',' => {
                chars.next();
                tokens.push(Token { kind: TokenKind::Comma, offset });
            }
            '"' => {
                chars.next();
                let text = lex_quoted(&mut chars, offset)?;
                tokens.push(Token {
                    kind: TokenKind::Value { text, quoted: true },
                    offset,
                });
            }
            '-' => {
                // A leading dash negates only when followed by whitespace,
                // an opening paren, end of input, or a letter; anywhere else
                // it opens an identifier such as `-5` or `--verbose`.
                let mut lookahead = chars.clone();
                lookahead.next();
                let negates = match lookahead.peek() {
                    None => true,
                    Some(&(_, next)) => next.is_whitespace() || next == '(' || next.is_alphabetic(),
                };
                if negates {
                    chars.next();
                    tokens.push(Token { kind: TokenKind::Not, offset });
                } else {
                    let word = lex_word(&mut chars);
                    tokens.push(Token {
                        kind: TokenKind::Value { text: word, quoted: false },
                        offset,
                    });
                }
            }
            c if is_word_char(c) => {
                let word = lex_word(&mut chars);
                let kind = match word.to_ascii_lowercase().as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    _ => TokenKind::Value { text: word, quoted: false },
                };
                tokens.push(Token { kind, offset });
            }
            other => {
                return Err(QueryError::Lex {
                    offset,
                    message: format!("unexpected character `{other}`"),
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        offset: input.len(),
    });
    Ok(tokens)
}

fn lex_word(chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>) -> String {
    let mut word = String::new();
    while let Some(&(_, c)) = chars.peek() {
        if is_word_char(c) {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

fn lex_quoted(
    chars: &mut std::iter::Peekable<std::str::CharIndices<'_>>,
    open_offset: usize,
) -> Result<String, QueryError> {
    let mut text = String::new();
    loop {
        match chars.next() {
            None => {
                return Err(QueryError::Lex {
                    offset: open_offset,
                    message: "unterminated quoted string".to_string(),
                });
            }
            Some((_, '"')) => return Ok(text),
            Some((escape_offset, '\\')) => match chars.next() {
                None => {
                    return Err(QueryError::Lex {
                        offset: escape_offset,
                        message: "unterminated escape sequence".to_string(),
                    });
                }
                Some((_, 'n')) => text.push('\n'),
                Some((_, 't')) => text.push('\t'),
                Some((_, c @ ('"' | '\\'))) => text.push(c),
                Some((_, c)) => text.push(c),
            },
            Some((_, c)) => text.push(c),
        }
    }
}
