//! Condition predicate evaluation for branching nodes.
//!
//! Predicates are structured JSON objects evaluated against the
//! session state tree:
//!
//! - Leaf comparison: `{"var": "user.age", "gte": 18}` with operators
//!   `eq`, `ne`, `gt`, `gte`, `lt`, `lte`, `in`, `contains`, `exists`
//! - Combinators: `{"and": [...]}`, `{"or": [...]}`, `{"not": {...}}`
//!
//! Malformed predicates never error: they evaluate as non-matching so
//! an authoring mistake routes down the default path instead of
//! failing a live session.

use serde_json::Value;

use crate::paths::get_by_path;

/// Evaluate a predicate against a state root value.
///
/// # Examples
///
/// ```rust
/// use chatloom::condition::evaluate;
/// use serde_json::json;
///
/// let state = json!({"user": {"age": 21, "role": "admin"}});
///
/// assert!(evaluate(&json!({"var": "user.age", "gte": 18}), &state));
/// assert!(evaluate(
///     &json!({"and": [
///         {"var": "user.age", "gte": 18},
///         {"var": "user.role", "in": ["admin", "moderator"]},
///     ]}),
///     &state,
/// ));
/// // Malformed predicates are non-matching, never an error.
/// assert!(!evaluate(&json!("user.age >= 18"), &state));
/// ```
#[must_use]
pub fn evaluate(condition: &Value, state: &Value) -> bool {
    let Value::Object(obj) = condition else {
        return false;
    };

    if let Some(Value::Array(clauses)) = obj.get("and") {
        return clauses.iter().all(|c| evaluate(c, state));
    }
    if let Some(Value::Array(clauses)) = obj.get("or") {
        return clauses.iter().any(|c| evaluate(c, state));
    }
    if let Some(inner) = obj.get("not") {
        return !evaluate(inner, state);
    }

    let Some(Value::String(var_path)) = obj.get("var") else {
        return false;
    };
    let actual = get_by_path(state, var_path);

    if let Some(expected) = obj.get("eq") {
        return actual == Some(expected);
    }
    if let Some(expected) = obj.get("ne") {
        return actual != Some(expected);
    }
    if let Some(expected) = obj.get("gt") {
        return compare(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Greater);
    }
    if let Some(expected) = obj.get("gte") {
        return compare(actual, expected).is_some_and(|o| o != std::cmp::Ordering::Less);
    }
    if let Some(expected) = obj.get("lt") {
        return compare(actual, expected).is_some_and(|o| o == std::cmp::Ordering::Less);
    }
    if let Some(expected) = obj.get("lte") {
        return compare(actual, expected).is_some_and(|o| o != std::cmp::Ordering::Greater);
    }
    if let Some(Value::Array(haystack)) = obj.get("in") {
        return actual.is_some_and(|v| haystack.contains(v));
    }
    if let Some(needle) = obj.get("contains") {
        return contains(actual, needle);
    }
    if obj.contains_key("exists") {
        let want = obj.get("exists").and_then(Value::as_bool).unwrap_or(true);
        return actual.is_some_and(|v| !v.is_null()) == want;
    }

    false
}

/// Ordered comparison for numbers and strings; mixed or non-ordered
/// types do not compare.
fn compare(actual: Option<&Value>, expected: &Value) -> Option<std::cmp::Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// Containment: substring for strings, membership for arrays.
fn contains(actual: Option<&Value>, needle: &Value) -> bool {
    match actual {
        Some(Value::String(haystack)) => needle
            .as_str()
            .is_some_and(|needle| haystack.contains(needle)),
        Some(Value::Array(items)) => items.contains(needle),
        _ => false,
    }
}
