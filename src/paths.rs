//! Dotted-path JSON helpers shared by the state tree, the variable
//! resolver, and the node processors.
//!
//! Paths are dot-separated (e.g. `"user.profile.name"`). Numeric
//! segments index into arrays on reads; writes create intermediate
//! objects as needed.

use miette::Diagnostic;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from path-based JSON manipulation.
#[derive(Debug, Error, Diagnostic)]
pub enum PathError {
    /// A write traversed into a non-object value.
    #[error("cannot write through non-object value at '{path}'")]
    #[diagnostic(
        code(chatloom::paths::not_an_object),
        help("Intermediate path segments must resolve to JSON objects.")
    )]
    NotAnObject { path: String },

    /// The path was empty where a key is required.
    #[error("empty path")]
    #[diagnostic(code(chatloom::paths::empty))]
    Empty,
}

/// Get a value by dotted path.
///
/// Objects are traversed by key; arrays by numeric segment. Returns
/// `None` when any segment is missing or of the wrong shape.
///
/// # Examples
///
/// ```rust
/// use chatloom::paths::get_by_path;
/// use serde_json::json;
///
/// let data = json!({"user": {"tags": ["a", "b"]}});
/// assert_eq!(get_by_path(&data, "user.tags.1"), Some(&json!("b")));
/// assert_eq!(get_by_path(&data, "user.missing"), None);
/// ```
#[must_use]
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a value by dotted path, creating intermediate objects as needed.
///
/// Writing through an existing non-object segment is an error; arrays
/// are not created or grown on writes.
///
/// # Examples
///
/// ```rust
/// use chatloom::paths::set_by_path;
/// use serde_json::json;
///
/// let mut data = json!({});
/// set_by_path(&mut data, "user.profile.name", json!("Ada")).unwrap();
/// assert_eq!(data, json!({"user": {"profile": {"name": "Ada"}}}));
/// ```
pub fn set_by_path(target: &mut Value, path: &str, value: Value) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = target;

    for part in &parts[..parts.len() - 1] {
        match current {
            Value::Object(obj) => {
                current = obj
                    .entry(part.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            _ => {
                return Err(PathError::NotAnObject {
                    path: path.to_string(),
                });
            }
        }
    }

    match current {
        Value::Object(obj) => {
            obj.insert(parts[parts.len() - 1].to_string(), value);
            Ok(())
        }
        _ => Err(PathError::NotAnObject {
            path: path.to_string(),
        }),
    }
}

/// Remove a value by dotted path. Returns the removed value if present.
pub fn remove_by_path(target: &mut Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = target;
    for part in &parts[..parts.len() - 1] {
        match current {
            Value::Object(obj) => current = obj.get_mut(*part)?,
            _ => return None,
        }
    }
    match current {
        Value::Object(obj) => obj.remove(parts[parts.len() - 1]),
        _ => None,
    }
}

/// Deep-merge `overlay` into `base`. Objects merge recursively; any
/// other value from the overlay replaces the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_obj), Value::Object(overlay_obj)) => {
            for (key, value) in overlay_obj {
                match base_obj.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_obj.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_val) => {
            *base_slot = overlay_val.clone();
        }
    }
}

/// Canonicalize a JSON value: object keys sorted recursively, arrays in
/// place. Used to compute stable state hashes.
#[must_use]
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&obj[key]));
            }
            Value::Object(out)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
