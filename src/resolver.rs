//! Variable resolution: `{{scope.path}}` template substitution against
//! the session state tree.
//!
//! References name a scope (`user`, `context`, `temp`, `system`, plus
//! `input`/`output`/`local` when a composite overlay is attached) and a
//! dotted path inside it. Two resolution modes exist:
//!
//! - [`VariableResolver::resolve_template`]: substitute every reference
//!   inside a string, stringifying the resolved values
//! - [`VariableResolver::resolve_value`]: recursive resolution over any
//!   JSON value, where a string that is *exactly one* reference
//!   resolves to the raw typed value instead of its string form
//!
//! # Examples
//!
//! ```rust
//! use chatloom::resolver::VariableResolver;
//! use chatloom::state::StateTree;
//! use serde_json::json;
//!
//! let mut state = StateTree::new();
//! state.set("user.name", json!("Ada")).unwrap();
//! state.set("temp.count", json!(5)).unwrap();
//!
//! let resolver = VariableResolver::new(&state);
//! assert_eq!(resolver.resolve_template("Hi {{user.name}}!"), "Hi Ada!");
//! // Full-match rule: raw typed value, not "5".
//! assert_eq!(resolver.resolve_value(&json!("{{temp.count}}")), json!(5));
//! ```

use miette::Diagnostic;
use serde_json::Value;
use thiserror::Error;

use crate::paths::get_by_path;
use crate::state::StateTree;

/// Scopes that action targets may write to. `user`, `context`, and
/// composite `input` are read-only for flow-authored writes.
pub const WRITABLE_SCOPES: [&str; 4] = ["temp", "system", "output", "local"];

/// Errors raised by scoped write validation.
#[derive(Debug, Error, Diagnostic)]
pub enum ResolverError {
    #[error("scope '{scope}' is read-only")]
    #[diagnostic(
        code(chatloom::resolver::read_only_scope),
        help("Flow actions may write to temp, system, output, or local.")
    )]
    ReadOnlyScope { scope: String },

    #[error("variable target '{target}' has no scope prefix")]
    #[diagnostic(
        code(chatloom::resolver::missing_scope),
        help("Targets are dotted paths starting with a scope, e.g. temp.counter.")
    )]
    MissingScope { target: String },
}

/// Validate that a dotted write target starts with a writable scope.
pub fn check_writable(target: &str) -> Result<(), ResolverError> {
    let scope = target
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ResolverError::MissingScope {
            target: target.to_string(),
        })?;
    if WRITABLE_SCOPES.contains(&scope) {
        Ok(())
    } else {
        Err(ResolverError::ReadOnlyScope {
            scope: scope.to_string(),
        })
    }
}

/// Resolves `{{...}}` references against a session state tree, with an
/// optional composite scope overlay.
#[derive(Clone, Copy, Debug)]
pub struct VariableResolver<'a> {
    state: &'a StateTree,
    overlay: Option<&'a Value>,
    preserve_unresolved: bool,
}

impl<'a> VariableResolver<'a> {
    /// Resolver over a session state tree. Unresolved references are
    /// preserved verbatim by default.
    #[must_use]
    pub fn new(state: &'a StateTree) -> Self {
        Self {
            state,
            overlay: None,
            preserve_unresolved: true,
        }
    }

    /// Attach a composite scope overlay (`{input, output, local, temp}`
    /// object). Overlay scopes shadow the session tree.
    #[must_use]
    pub fn with_overlay(mut self, overlay: &'a Value) -> Self {
        self.overlay = Some(overlay);
        self
    }

    /// Control unresolved-reference behavior: `true` leaves the
    /// `{{...}}` literal in place, `false` substitutes an empty string
    /// (or `null` under the full-match rule).
    #[must_use]
    pub fn preserve_unresolved(mut self, preserve: bool) -> Self {
        self.preserve_unresolved = preserve;
        self
    }

    /// Look up a reference path, consulting the overlay first.
    #[must_use]
    pub fn lookup(&self, reference: &str) -> Option<&Value> {
        if let Some(overlay) = self.overlay {
            let scope = reference.split('.').next().unwrap_or(reference);
            if overlay.get(scope).is_some() {
                if let Some(found) = get_by_path(overlay, reference) {
                    return Some(found);
                }
            }
        }
        get_by_path(self.state.as_value(), reference)
    }

    /// Substitute every `{{reference}}` in a template string.
    ///
    /// Resolved non-string values render via their compact JSON form;
    /// strings render unquoted.
    #[must_use]
    pub fn resolve_template(&self, template: &str) -> String {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find("}}") {
                Some(end) => {
                    let reference = after[..end].trim();
                    match self.lookup(reference) {
                        Some(value) => out.push_str(&render(value)),
                        None if self.preserve_unresolved => {
                            out.push_str(&rest[start..start + 2 + end + 2]);
                        }
                        None => {}
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    // Unterminated reference; emit the remainder as-is.
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Recursively resolve references within a JSON value.
    ///
    /// A string that is exactly one reference resolves to the raw
    /// typed value (the full-match rule); any other string goes
    /// through template substitution. Objects and arrays resolve
    /// element-wise.
    #[must_use]
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => {
                if let Some(reference) = full_match_reference(s) {
                    match self.lookup(reference) {
                        Some(found) => found.clone(),
                        None if self.preserve_unresolved => Value::String(s.clone()),
                        None => Value::Null,
                    }
                } else {
                    Value::String(self.resolve_template(s))
                }
            }
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.resolve_value(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}

/// If `s` is exactly a single `{{reference}}`, return the trimmed
/// inner reference.
fn full_match_reference(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    // A second opening brace means this is a template, not one reference.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
