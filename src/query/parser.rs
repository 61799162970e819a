use super::{
    ast::{Expr, Term},
    lexer::{Token, TokenKind},
    Field, QueryError,
};

/// Recursive descent over the token stream. Precedence, tightest first:
/// parentheses, `NOT`, implicit/explicit `AND`, `OR`.
pub fn parse(tokens: Vec<Token>) -> Result<Expr, QueryError> {
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    match parser.peek().kind {
        TokenKind::Eof => Ok(expr),
        _ => Err(parser.syntax_error("expected end of query")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn syntax_error(&self, message: &str) -> QueryError {
        QueryError::Syntax {
            offset: self.peek().offset,
            message: message.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek().kind, TokenKind::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::or(left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, QueryError> {
        let mut left = self.parse_unary()?;
        loop {
            match self.peek().kind {
                TokenKind::And => {
                    self.advance();
                    let right = self.parse_unary()?;
                    left = Expr::and(left, right);
                }
                // Adjacent terms compose as an implicit AND.
                TokenKind::Value { .. } | TokenKind::Not | TokenKind::LParen => {
                    let right = self.parse_unary()?;
                    left = Expr::and(left, right);
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, QueryError> {
        match self.peek().kind {
            TokenKind::Not => {
                self.advance();
                let inner = self.parse_unary()?;
                // Negating a bare term folds into the term itself; both
                // forms mean the same thing to the evaluator.
                Ok(match inner {
                    Expr::Term(mut term) => {
                        term.negated = !term.negated;
                        Expr::Term(term)
                    }
                    other => Expr::Not(Box::new(other)),
                })
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_or()?;
                match self.peek().kind {
                    TokenKind::RParen => {
                        self.advance();
                        Ok(Expr::Paren(Box::new(inner)))
                    }
                    _ => Err(self.syntax_error("expected `)`")),
                }
            }
            TokenKind::Value { .. } => self.parse_term(),
            _ => Err(self.syntax_error("expected a term")),
        }
    }

    fn parse_term(&mut self) -> Result<Expr, QueryError> {
        let text = match self.advance().kind {
            TokenKind::Value { text, .. } => text,
            _ => unreachable!("parse_term called on a non-value token"),
        };

        if !matches!(self.peek().kind, TokenKind::Colon) {
            return Ok(Expr::FreeText(text));
        }
        self.advance();

        let field = Field::from_name(&text).ok_or_else(|| QueryError::UnknownField {
            field: text.clone(),
        })?;

        let mut values = vec![self.expect_value()?];
        while matches!(self.peek().kind, TokenKind::Comma) {
            self.advance();
            values.push(self.expect_value()?);
        }

        Ok(Expr::Term(Term {
            field,
            values,
            negated: false,
        }))
    }

    fn expect_value(&mut self) -> Result<String, QueryError> {
        match self.peek().kind.clone() {
            TokenKind::Value { text, .. } => {
                self.advance();
                Ok(text)
            }
            // Keyword words are plain values when a value is expected, so
            // `reason:not` keeps working.
            TokenKind::And => {
                self.advance();
                Ok("and".to_string())
            }
            TokenKind::Or => {
                self.advance();
                Ok("or".to_string())
            }
            TokenKind::Not => {
                self.advance();
                Ok("not".to_string())
            }
            _ => Err(self.syntax_error("expected a value after `:`")),
        }
    }
}
