//! Locked-down Rhai engine for conditional-edge predicates.

use orcheo_types::OrcheoError;
use rhai::{Array, Dynamic, Engine, Map, Scope};
use serde_json::{Map as JsonMap, Number, Value};

/// Predicate evaluation engine using a raw Rhai configuration: no module
/// access, bounded operations and depth.
pub struct ExpressionEngine {
    engine: Engine,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        let mut engine = Engine::new_raw();
        engine.set_max_operations(50_000);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
        ExpressionEngine { engine }
    }
}

impl ExpressionEngine {
    /// Evaluate an expression against the run state. The state object is
    /// exposed as `state` and its top-level keys as plain variables.
    pub fn evaluate(&self, expr: &str, state: &Value) -> Result<Value, OrcheoError> {
        let mut scope = Scope::new();
        scope.push_dynamic("state", to_dynamic(state));
        if let Some(map) = state.as_object() {
            for (key, value) in map {
                scope.push_dynamic(key.clone(), to_dynamic(value));
            }
        }
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, expr)
            .map_err(|err| {
                OrcheoError::GraphValidation(format!(
                    "predicate '{expr}' failed to evaluate: {err}"
                ))
            })?;
        Ok(from_dynamic(result))
    }

    /// Evaluate a predicate and coerce the result into a branch key.
    pub fn evaluate_branch_key(&self, expr: &str, state: &Value) -> Result<String, OrcheoError> {
        match self.evaluate(expr, state)? {
            Value::String(key) => Ok(key),
            Value::Bool(flag) => Ok(flag.to_string()),
            Value::Number(number) => Ok(number.to_string()),
            other => Err(OrcheoError::Execution(format!(
                "predicate '{expr}' returned a non-scalar branch key: {other}"
            ))),
        }
    }
}

pub(crate) fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(flag) => Dynamic::from(*flag),
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Dynamic::from(int)
            } else if let Some(float) = number.as_f64() {
                Dynamic::from(float)
            } else {
                Dynamic::from(0_i64)
            }
        }
        Value::String(text) => Dynamic::from(text.clone()),
        Value::Array(items) => {
            let mut array = Array::new();
            for item in items {
                array.push(to_dynamic(item));
            }
            Dynamic::from_array(array)
        }
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}

pub(crate) fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Some(flag) = value.clone().try_cast::<bool>() {
        return Value::Bool(flag);
    }
    if let Some(int) = value.clone().try_cast::<i64>() {
        return Value::Number(Number::from(int));
    }
    if let Some(float) = value.clone().try_cast::<f64>() {
        if let Some(number) = Number::from_f64(float) {
            return Value::Number(number);
        }
    }
    if let Some(text) = value.clone().try_cast::<String>() {
        return Value::String(text);
    }
    if let Some(array) = value.clone().try_cast::<Array>() {
        return Value::Array(array.into_iter().map(from_dynamic).collect());
    }
    if let Some(map) = value.clone().try_cast::<Map>() {
        let mut json_map = JsonMap::new();
        for (key, value) in map {
            json_map.insert(key.into(), from_dynamic(value));
        }
        return Value::Object(json_map);
    }
    Value::Null
}
