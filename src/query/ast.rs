/// Query AST. A closed sum with exhaustive matching in the evaluator and
/// the store translator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Term(Term),
    FreeText(String),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Paren(Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    And,
    Or,
}

/// `field:value` or `field:v1,v2,v3`. A comma separated list is one term;
/// its values are OR-combined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    pub field: Field,
    pub values: Vec<String>,
    pub negated: bool,
}

impl Expr {
    pub fn and(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::And,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op: BinaryOp::Or,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn term(field: Field, value: &str) -> Expr {
        Expr::Term(Term {
            field,
            values: vec![value.to_string()],
            negated: false,
        })
    }

    /// Walks every term in the expression, negation-blind.
    pub fn for_each_term<'a>(&'a self, f: &mut impl FnMut(&'a Term)) {
        match self {
            Expr::Term(term) => f(term),
            Expr::FreeText(_) => {}
            Expr::Binary { left, right, .. } => {
                left.for_each_term(f);
                right.for_each_term(f);
            }
            Expr::Not(inner) | Expr::Paren(inner) => inner.for_each_term(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Is,
    In,
    Repo,
    Org,
    Reason,
    Type,
    Author,
    State,
    Merged,
    StateReason,
    Read,
    Archived,
    Muted,
    Snoozed,
    Filtered,
    Tags,
}

impl Field {
    pub fn from_name(name: &str) -> Option<Field> {
        Some(match name.to_ascii_lowercase().as_str() {
            "is" => Field::Is,
            "in" => Field::In,
            "repo" | "repository" => Field::Repo,
            "org" => Field::Org,
            "reason" => Field::Reason,
            "type" | "subject_type" => Field::Type,
            "author" => Field::Author,
            "state" => Field::State,
            "merged" => Field::Merged,
            "state_reason" => Field::StateReason,
            "read" => Field::Read,
            "archived" => Field::Archived,
            "muted" => Field::Muted,
            "snoozed" => Field::Snoozed,
            "filtered" => Field::Filtered,
            "tags" => Field::Tags,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Field::Is => "is",
            Field::In => "in",
            Field::Repo => "repo",
            Field::Org => "org",
            Field::Reason => "reason",
            Field::Type => "type",
            Field::Author => "author",
            Field::State => "state",
            Field::Merged => "merged",
            Field::StateReason => "state_reason",
            Field::Read => "read",
            Field::Archived => "archived",
            Field::Muted => "muted",
            Field::Snoozed => "snoozed",
            Field::Filtered => "filtered",
            Field::Tags => "tags",
        }
    }
}
