use chrono::{DateTime, Utc};
use sqlx::{query::Query, sqlite::SqliteArguments, Sqlite};

use forge_inbox::query::{
    ast::{BinaryOp, Expr, Term},
    validate::parse_bool,
    Field,
};

/// A translated query, ready to be executed by the store: which joins the
/// WHERE clause needs, the parameterised clause itself, and its bind
/// arguments in placeholder order. User scoping is added by the store, not
/// here.
#[derive(Debug, Clone)]
pub struct NotificationQuery {
    pub joins: Joins,
    pub where_sql: String,
    pub args: Vec<QueryArg>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Joins {
    pub repo: bool,
}

#[derive(Debug, Clone)]
pub enum QueryArg {
    Text(String),
    Bool(bool),
    DateTime(DateTime<Utc>),
}

pub fn bind_query_args<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    args: &[QueryArg],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for arg in args {
        query = match arg {
            QueryArg::Text(text) => query.bind(text.clone()),
            QueryArg::Bool(b) => query.bind(*b),
            QueryArg::DateTime(ts) => query.bind(*ts),
        };
    }
    query
}

/// Translates a validated AST into a parameterised WHERE clause. Must stay
/// semantically identical to the in-memory evaluator: the same `now` is
/// bound wherever snooze or inbox membership is tested, and predicates over
/// nullable columns are COALESCEd so negation behaves two-valued.
pub fn translate(expr: &Expr, now: DateTime<Utc>, limit: i64, offset: i64) -> NotificationQuery {
    let mut translator = Translator {
        sql: String::new(),
        args: Vec::new(),
        joins: Joins::default(),
        now,
    };
    translator.push_expr(expr);
    NotificationQuery {
        joins: translator.joins,
        where_sql: translator.sql,
        args: translator.args,
        limit,
        offset,
    }
}

struct Translator {
    sql: String,
    args: Vec<QueryArg>,
    joins: Joins,
    now: DateTime<Utc>,
}

impl Translator {
    fn push_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Term(term) => self.push_term(term),
            Expr::FreeText(text) => {
                self.joins.repo = true;
                self.sql.push_str(
                    "(notification.subject_title LIKE ? ESCAPE '\\' \
                     OR repo.full_name LIKE ? ESCAPE '\\')",
                );
                let pattern = like_pattern(text);
                self.args.push(QueryArg::Text(pattern.clone()));
                self.args.push(QueryArg::Text(pattern));
            }
            Expr::Binary { op, left, right } => {
                self.sql.push('(');
                self.push_expr(left);
                self.sql.push_str(match op {
                    BinaryOp::And => " AND ",
                    BinaryOp::Or => " OR ",
                });
                self.push_expr(right);
                self.sql.push(')');
            }
            Expr::Not(inner) => {
                self.sql.push_str("NOT (");
                self.push_expr(inner);
                self.sql.push(')');
            }
            Expr::Paren(inner) => {
                self.sql.push('(');
                self.push_expr(inner);
                self.sql.push(')');
            }
        }
    }

    fn push_term(&mut self, term: &Term) {
        if term.negated {
            self.sql.push_str("NOT ");
        }
        self.sql.push('(');
        for (i, value) in term.values.iter().enumerate() {
            if i > 0 {
                self.sql.push_str(" OR ");
            }
            self.push_value(term.field, value);
        }
        self.sql.push(')');
    }

    fn push_value(&mut self, field: Field, value: &str) {
        match field {
            Field::Is => self.push_is_value(value),
            Field::In => self.push_in_value(value),
            Field::Repo => {
                self.joins.repo = true;
                self.push_like("repo.full_name", value);
            }
            Field::Org => {
                self.joins.repo = true;
                self.push_like("repo.owner_login", value);
            }
            Field::Reason => self.push_like("notification.reason", value),
            Field::Type => self.push_like("notification.subject_kind", value),
            Field::Author => self.push_nullable_like("notification.author_login", value),
            Field::State => self.push_nullable_eq("notification.subject_state", value),
            Field::StateReason => {
                self.push_nullable_eq("notification.subject_state_reason", value)
            }
            Field::Merged => match parse_bool(value) {
                Some(b) => {
                    self.sql
                        .push_str("COALESCE(notification.subject_merged = ?, 0)");
                    self.args.push(QueryArg::Bool(b));
                }
                None => self.push_never(),
            },
            Field::Read => self.push_flag("notification.is_read", value),
            Field::Archived => self.push_flag("notification.archived", value),
            Field::Muted => self.push_flag("notification.muted", value),
            Field::Filtered => self.push_flag("notification.filtered", value),
            Field::Snoozed => match parse_bool(value) {
                Some(true) => self.push_snoozed_active(),
                Some(false) => self.push_not_snoozed(),
                None => self.push_never(),
            },
            Field::Tags => {
                self.sql.push_str(
                    "EXISTS (SELECT 1 FROM tag_assignment ta \
                     JOIN tag ON tag.id = ta.tag_id \
                     WHERE ta.entity_type = 'notification' \
                     AND ta.entity_id = notification.id \
                     AND (tag.name LIKE ? ESCAPE '\\' OR tag.slug LIKE ? ESCAPE '\\'))",
                );
                let pattern = like_pattern(value);
                self.args.push(QueryArg::Text(pattern.clone()));
                self.args.push(QueryArg::Text(pattern));
            }
        }
    }

    fn push_is_value(&mut self, value: &str) {
        match value {
            "read" => self.sql.push_str("notification.is_read = 1"),
            "unread" => self.sql.push_str("notification.is_read = 0"),
            "archived" => self.sql.push_str("notification.archived = 1"),
            "inbox" => self.push_in_inbox(),
            "muted" => self.sql.push_str("notification.muted = 1"),
            "unmuted" => self.sql.push_str("notification.muted = 0"),
            "starred" => self.sql.push_str("notification.starred = 1"),
            "unstarred" => self.sql.push_str("notification.starred = 0"),
            "snoozed" => self.push_snoozed_active(),
            "unsnoozed" => self.push_not_snoozed(),
            "active" => {
                self.sql.push_str("(notification.archived = 0 AND ");
                self.push_not_snoozed();
                self.sql.push(')');
            }
            "filtered" => self.sql.push_str("notification.filtered = 1"),
            _ => self.push_never(),
        }
    }

    fn push_in_value(&mut self, value: &str) {
        match value {
            "inbox" => self.push_in_inbox(),
            "archive" => self.sql.push_str("notification.archived = 1"),
            "snoozed" => self.push_snoozed_active(),
            "filtered" => self
                .sql
                .push_str("(notification.filtered = 1 AND notification.archived = 0)"),
            "anywhere" => self.sql.push_str("1 = 1"),
            _ => self.push_never(),
        }
    }

    fn push_in_inbox(&mut self) {
        self.sql.push_str(
            "(notification.archived = 0 AND notification.muted = 0 \
             AND notification.filtered = 0 AND ",
        );
        self.push_not_snoozed();
        self.sql.push(')');
    }

    fn push_snoozed_active(&mut self) {
        self.sql.push_str(
            "(notification.snoozed_until IS NOT NULL AND notification.snoozed_until > ?)",
        );
        self.args.push(QueryArg::DateTime(self.now));
    }

    fn push_not_snoozed(&mut self) {
        self.sql.push_str(
            "(notification.snoozed_until IS NULL OR notification.snoozed_until <= ?)",
        );
        self.args.push(QueryArg::DateTime(self.now));
    }

    fn push_like(&mut self, column: &str, value: &str) {
        self.sql.push_str(column);
        self.sql.push_str(" LIKE ? ESCAPE '\\'");
        self.args.push(QueryArg::Text(like_pattern(value)));
    }

    fn push_nullable_like(&mut self, column: &str, value: &str) {
        self.sql.push_str("COALESCE(");
        self.sql.push_str(column);
        self.sql.push_str(" LIKE ? ESCAPE '\\', 0)");
        self.args.push(QueryArg::Text(like_pattern(value)));
    }

    fn push_nullable_eq(&mut self, column: &str, value: &str) {
        self.sql.push_str("COALESCE(");
        self.sql.push_str(column);
        self.sql.push_str(" = ?, 0)");
        self.args.push(QueryArg::Text(value.to_string()));
    }

    fn push_flag(&mut self, column: &str, value: &str) {
        match parse_bool(value) {
            Some(b) => {
                self.sql.push_str(column);
                self.sql.push_str(" = ?");
                self.args.push(QueryArg::Bool(b));
            }
            None => self.push_never(),
        }
    }

    // Unknown values are rejected by the validator; if one slips through it
    // matches nothing, exactly as in the evaluator.
    fn push_never(&mut self) {
        self.sql.push_str("0 = 1");
    }
}

/// `%value%` with LIKE wildcards in the value escaped.
fn like_pattern(value: &str) -> String {
    let mut pattern = String::with_capacity(value.len() + 2);
    pattern.push('%');
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}
