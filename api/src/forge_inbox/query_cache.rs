use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use once_cell::sync::Lazy;

use forge_inbox::query::{parse, Expr, QueryError};

/// Process-local compiled-query cache, keyed by the raw query string.
/// Flushed whenever views or rules are mutated so stale predicates never
/// outlive the definitions they came from.
static QUERY_CACHE: Lazy<Mutex<HashMap<String, Arc<Expr>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn compile(query: &str) -> Result<Arc<Expr>, QueryError> {
    if let Some(expr) = QUERY_CACHE
        .lock()
        .expect("query cache lock poisoned")
        .get(query)
    {
        return Ok(expr.clone());
    }

    let expr = Arc::new(parse(query)?);
    QUERY_CACHE
        .lock()
        .expect("query cache lock poisoned")
        .insert(query.to_string(), expr.clone());
    Ok(expr)
}

pub fn flush() {
    QUERY_CACHE
        .lock()
        .expect("query cache lock poisoned")
        .clear();
}
