use super::{
    ast::{Expr, Term},
    Field,
};

/// Default filter overlay applied on top of user queries.
///
/// An empty query means the inbox. A query with no `in:` term additionally
/// excludes muted notifications, unless the query itself takes a position on
/// the muted dimension. Any `in:` term suppresses the overlay entirely.
pub fn with_overlay(expr: Option<Expr>) -> Expr {
    match expr {
        None => inbox_term(),
        Some(expr) => {
            if contains_in_term(&expr) || mentions_muted(&expr) {
                expr
            } else {
                Expr::and(expr, muted_exclusion())
            }
        }
    }
}

pub fn inbox_term() -> Expr {
    Expr::term(Field::In, "inbox")
}

fn muted_exclusion() -> Expr {
    Expr::term(Field::Muted, "false")
}

pub fn contains_in_term(expr: &Expr) -> bool {
    let mut found = false;
    expr.for_each_term(&mut |term| {
        if term.field == Field::In {
            found = true;
        }
    });
    found
}

/// `is:muted` (or any explicit muted term) is always honoured and must not
/// be cancelled by the muted-exclusion overlay.
pub fn mentions_muted(expr: &Expr) -> bool {
    let mut found = false;
    expr.for_each_term(&mut |term| match term.field {
        Field::Muted => found = true,
        Field::Is => {
            if term
                .values
                .iter()
                .any(|v| v == "muted" || v == "unmuted")
            {
                found = true;
            }
        }
        _ => {}
    });
    found
}
