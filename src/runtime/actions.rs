//! Action execution for ACTION nodes and composite children.
//!
//! Actions run in authored order with per-action error isolation: a
//! failing action is recorded in the report and the remaining actions
//! still run. Supported types: `set_variable`, `increment`,
//! `decrement`, `append`, `remove`, `clear`, `calculate`, `aggregate`,
//! and `api_call` (dispatched through an injected [`ApiRegistry`],
//! never raw HTTP, and guarded by a per-handler circuit breaker).

use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::resolver::{VariableResolver, check_writable};
use crate::state::StateTree;

/// A named in-process handler backing `api_call` actions.
pub type ApiHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Registry of `api_call` handlers, injected into the action runner.
#[derive(Default)]
pub struct ApiRegistry {
    handlers: Mutex<FxHashMap<String, ApiHandler>>,
}

impl ApiRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under a name, replacing any existing one.
    pub async fn register<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.lock().await;
        handlers.insert(name.into(), Arc::new(handler));
    }

    async fn get(&self, name: &str) -> Option<ApiHandler> {
        self.handlers.lock().await.get(name).cloned()
    }
}

/// One recorded action failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionFailure {
    pub index: usize,
    pub action_type: String,
    pub message: String,
}

/// Outcome of running one action list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ActionReport {
    pub attempted: usize,
    pub failures: Vec<ActionFailure>,
}

impl ActionReport {
    /// Whether every action succeeded.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failures as a JSON array for recording into state.
    #[must_use]
    pub fn failures_json(&self) -> Value {
        Value::Array(
            self.failures
                .iter()
                .map(|f| {
                    json!({
                        "index": f.index,
                        "action_type": f.action_type,
                        "message": f.message,
                    })
                })
                .collect(),
        )
    }
}

/// Write surface for one action run: the session state plus, inside a
/// composite, the isolated `{input, output, local}` overlay. Targets in
/// `output.` or `local.` go to the overlay; everything else goes
/// through the writable-scope check into session state.
pub struct ActionScope<'a> {
    pub state: &'a mut StateTree,
    pub overlay: Option<&'a mut Value>,
}

impl<'a> ActionScope<'a> {
    #[must_use]
    pub fn session(state: &'a mut StateTree) -> Self {
        Self {
            state,
            overlay: None,
        }
    }

    fn resolve(&self, value: &Value) -> Value {
        let mut resolver = VariableResolver::new(self.state);
        if let Some(overlay) = self.overlay.as_deref() {
            resolver = resolver.with_overlay(overlay);
        }
        resolver.resolve_value(value)
    }

    fn read(&self, path: &str) -> Option<Value> {
        let mut resolver = VariableResolver::new(self.state);
        if let Some(overlay) = self.overlay.as_deref() {
            resolver = resolver.with_overlay(overlay);
        }
        resolver.lookup(path).cloned()
    }

    fn write(&mut self, target: &str, value: Value) -> Result<(), String> {
        let scope = target.split('.').next().unwrap_or(target);
        if matches!(scope, "output" | "local") {
            let overlay = self
                .overlay
                .as_deref_mut()
                .ok_or_else(|| format!("scope '{scope}' only exists inside a composite"))?;
            return crate::paths::set_by_path(overlay, target, value).map_err(|e| e.to_string());
        }
        check_writable(target).map_err(|e| e.to_string())?;
        self.state.set(target, value).map_err(|e| e.to_string())
    }

    fn remove(&mut self, target: &str) -> Result<(), String> {
        let scope = target.split('.').next().unwrap_or(target);
        if matches!(scope, "output" | "local") {
            let overlay = self
                .overlay
                .as_deref_mut()
                .ok_or_else(|| format!("scope '{scope}' only exists inside a composite"))?;
            crate::paths::remove_by_path(overlay, target);
            return Ok(());
        }
        check_writable(target).map_err(|e| e.to_string())?;
        self.state.remove(target);
        Ok(())
    }

    fn clear(&mut self, scope: &str) -> Result<(), String> {
        if matches!(scope, "output" | "local") {
            let overlay = self
                .overlay
                .as_deref_mut()
                .ok_or_else(|| format!("scope '{scope}' only exists inside a composite"))?;
            return crate::paths::set_by_path(overlay, scope, Value::Object(Map::new()))
                .map_err(|e| e.to_string());
        }
        check_writable(scope).map_err(|e| e.to_string())?;
        self.state.clear_scope(scope);
        Ok(())
    }
}

/// Run an action list against a scope. Never fails as a whole; the
/// report carries any per-action failures.
pub async fn run_actions(
    scope: &mut ActionScope<'_>,
    actions: &[Value],
    api: &ApiRegistry,
    breakers: &BreakerRegistry,
) -> ActionReport {
    let mut report = ActionReport::default();
    for (index, action) in actions.iter().enumerate() {
        report.attempted += 1;
        let action_type = action
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if let Err(message) = run_one(scope, &action_type, action, api, breakers).await {
            tracing::warn!(index, action_type = %action_type, error = %message, "action failed");
            report.failures.push(ActionFailure {
                index,
                action_type,
                message,
            });
        }
    }
    report
}

async fn run_one(
    scope: &mut ActionScope<'_>,
    action_type: &str,
    action: &Value,
    api: &ApiRegistry,
    breakers: &BreakerRegistry,
) -> Result<(), String> {
    match action_type {
        "set_variable" => {
            let target = require_target(action)?;
            let value = scope.resolve(action.get("value").unwrap_or(&Value::Null));
            scope.write(&target, value)
        }
        "increment" | "decrement" => {
            let target = require_target(action)?;
            let by = scope.resolve(action.get("by").unwrap_or(&json!(1)));
            let mut by = as_number(&by).ok_or("'by' is not a number")?;
            if action_type == "decrement" {
                by = -by;
            }
            let current = scope
                .read(&target)
                .as_ref()
                .and_then(as_number)
                .unwrap_or(0.0);
            scope.write(&target, number_value(current + by))
        }
        "append" => {
            let target = require_target(action)?;
            let value = scope.resolve(action.get("value").unwrap_or(&Value::Null));
            let appended = match scope.read(&target) {
                Some(Value::Array(mut items)) => {
                    items.push(value);
                    Value::Array(items)
                }
                Some(Value::String(s)) => match value.as_str() {
                    Some(suffix) => Value::String(format!("{s}{suffix}")),
                    None => return Err("cannot append non-string to a string".to_string()),
                },
                None => Value::Array(vec![value]),
                Some(other) => {
                    return Err(format!(
                        "cannot append to {} value",
                        type_name(&other)
                    ));
                }
            };
            scope.write(&target, appended)
        }
        "remove" => {
            let target = require_target(action)?;
            scope.remove(&target)
        }
        "clear" => {
            let name = action
                .get("scope")
                .and_then(Value::as_str)
                .ok_or("'clear' requires a scope name")?
                .to_string();
            scope.clear(&name)
        }
        "calculate" => {
            let target = require_target(action)?;
            let op = action
                .get("op")
                .and_then(Value::as_str)
                .ok_or("'calculate' requires an op")?;
            let left = scope.resolve(action.get("left").unwrap_or(&Value::Null));
            let right = scope.resolve(action.get("right").unwrap_or(&Value::Null));
            let left = as_number(&left).ok_or("'left' is not a number")?;
            let right = as_number(&right).ok_or("'right' is not a number")?;
            let result = match op {
                "add" => left + right,
                "subtract" => left - right,
                "multiply" => left * right,
                "divide" => {
                    if right == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    left / right
                }
                other => return Err(format!("unknown op '{other}'")),
            };
            scope.write(&target, number_value(result))
        }
        "aggregate" => {
            let target = require_target(action)?;
            let op = action
                .get("op")
                .and_then(Value::as_str)
                .ok_or("'aggregate' requires an op")?;
            let source = scope.resolve(action.get("source").unwrap_or(&Value::Null));
            let items = source
                .as_array()
                .ok_or_else(|| format!("'source' is not a list ({})", type_name(&source)))?;
            let result = aggregate(op, items)?;
            scope.write(&target, result)
        }
        "api_call" => {
            let name = action
                .get("handler")
                .and_then(Value::as_str)
                .ok_or("'api_call' requires a handler name")?;
            let params = scope.resolve(action.get("params").unwrap_or(&Value::Null));
            let handler = api
                .get(name)
                .await
                .ok_or_else(|| format!("no api handler '{name}'"))?;
            let breaker = breakers.breaker(&format!("api:{name}")).await;
            let result = breaker.call(|| handler(params)).await.map_err(|e| match e {
                BreakerError::Open { endpoint } => format!("circuit open for {endpoint}"),
                BreakerError::Call { message } => message,
            })?;
            if let Some(target) = action.get("target").and_then(Value::as_str) {
                let target = target.to_string();
                scope.write(&target, result)?;
            }
            Ok(())
        }
        "" => Err("action has no type".to_string()),
        other => Err(format!("unknown action type '{other}'")),
    }
}

/// Numeric and structural reductions over a source list.
fn aggregate(op: &str, items: &[Value]) -> Result<Value, String> {
    match op {
        "count" => Ok(json!(items.len())),
        "sum" | "avg" | "min" | "max" => {
            let numbers: Vec<f64> = items
                .iter()
                .map(|item| as_number(item).ok_or_else(|| format!("non-numeric item in {op}")))
                .collect::<Result<_, _>>()?;
            if numbers.is_empty() && op != "sum" {
                return Err(format!("'{op}' over an empty list"));
            }
            let result = match op {
                "sum" => numbers.iter().sum(),
                "avg" => numbers.iter().sum::<f64>() / numbers.len() as f64,
                "min" => numbers.iter().copied().fold(f64::INFINITY, f64::min),
                _ => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            };
            Ok(number_value(result))
        }
        "merge" => {
            let mut merged = Map::new();
            for item in items {
                let Value::Object(map) = item else {
                    return Err(format!("cannot merge {} item", type_name(item)));
                };
                for (key, value) in map {
                    merged.insert(key.clone(), value.clone());
                }
            }
            Ok(Value::Object(merged))
        }
        "flatten" => {
            let mut flat = Vec::new();
            for item in items {
                match item {
                    Value::Array(inner) => flat.extend(inner.iter().cloned()),
                    other => flat.push(other.clone()),
                }
            }
            Ok(Value::Array(flat))
        }
        other => Err(format!("unknown aggregate op '{other}'")),
    }
}

fn require_target(action: &Value) -> Result<String, String> {
    action
        .get("target")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| "action requires a target path".to_string())
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Keep integral results as JSON integers so counters stay whole.
fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
