use super::{ast::Expr, Field, QueryError};

pub const IS_VALUES: [&str; 12] = [
    "read",
    "unread",
    "archived",
    "inbox",
    "muted",
    "unmuted",
    "starred",
    "unstarred",
    "snoozed",
    "unsnoozed",
    "active",
    "filtered",
];

pub const IN_VALUES: [&str; 5] = ["inbox", "archive", "snoozed", "filtered", "anywhere"];

/// Parses the boolean literals accepted by boolean-valued fields.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// Checks every term's values against its field. Unknown values are
/// rejected here rather than silently matching nothing at evaluation time.
pub fn validate(expr: &Expr) -> Result<(), QueryError> {
    let mut error = None;
    expr.for_each_term(&mut |term| {
        if error.is_some() {
            return;
        }
        for value in &term.values {
            if let Err(err) = validate_value(term.field, value) {
                error = Some(err);
                return;
            }
        }
    });
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

fn validate_value(field: Field, value: &str) -> Result<(), QueryError> {
    let invalid = || QueryError::InvalidValue {
        field: field.name().to_string(),
        value: value.to_string(),
    };
    match field {
        Field::Is => {
            if !IS_VALUES.contains(&value) {
                return Err(invalid());
            }
        }
        Field::In => {
            if !IN_VALUES.contains(&value) {
                return Err(invalid());
            }
        }
        Field::Merged
        | Field::Read
        | Field::Archived
        | Field::Muted
        | Field::Snoozed
        | Field::Filtered => {
            if parse_bool(value).is_none() {
                return Err(invalid());
            }
        }
        Field::Repo
        | Field::Org
        | Field::Reason
        | Field::Type
        | Field::Author
        | Field::State
        | Field::StateReason
        | Field::Tags => {
            if value.is_empty() {
                return Err(invalid());
            }
        }
    }
    Ok(())
}
