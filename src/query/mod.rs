//! The notification query language: `repo:acme/widgets is:unread -author:bot`.
//!
//! Pipeline: lexer -> recursive descent parser -> AST -> validator. The AST
//! has two consumers that must stay semantically identical: the in-memory
//! evaluator in [`eval`] and the store translator living next to the
//! repository layer.

pub mod ast;
pub mod eval;
pub mod lexer;
pub mod overlay;
pub mod parser;
pub mod validate;

pub use ast::{BinaryOp, Expr, Field, Term};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid query at byte {offset}: {message}")]
    Lex { offset: usize, message: String },
    #[error("syntax error at byte {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("unknown field `{field}`")]
    UnknownField { field: String },
    #[error("invalid value `{value}` for field `{field}`")]
    InvalidValue { field: String, value: String },
    #[error("`{slug}` is a reserved slug")]
    ReservedSlug { slug: String },
}

/// Parses and validates a query string.
pub fn parse(input: &str) -> Result<Expr, QueryError> {
    let tokens = lexer::lex(input)?;
    let expr = parser::parse(tokens)?;
    validate::validate(&expr)?;
    Ok(expr)
}

/// Parses a query that may be blank. A blank query is `None`; the overlay
/// turns it into the inbox query.
pub fn parse_optional(input: &str) -> Result<Option<Expr>, QueryError> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    parse(input).map(Some)
}
