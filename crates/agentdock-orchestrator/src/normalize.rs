use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Number, Value};

use agentdock_types::{FieldMap, RawValue, ResponseFields};

/// Keys carrying DOM locators. They bloat stored payloads and are removed
/// at every depth.
pub const SELECTOR_KEYS: &[&str] = &[
    "selector",
    "css_selector",
    "xpath_selector",
    "python_selector",
    "playwright_selector",
    "notte_selector",
    "iframe_parent_css_selectors",
];

const MAX_DEPTH: usize = 64;

/// Converts any provider value into plain JSON. Total: a subtree that cannot
/// be converted degrades to its string form.
pub fn to_json_safe(value: &RawValue) -> Value {
    convert(value, 0)
}

fn convert(value: &RawValue, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return Value::String(value.display_string());
    }
    match value {
        RawValue::Null => Value::Null,
        RawValue::Bool(b) => Value::Bool(*b),
        RawValue::Int(n) => Value::from(*n),
        RawValue::UInt(n) => Value::from(*n),
        RawValue::Float(f) => float_value(*f),
        RawValue::Text(s) => Value::String(s.clone()),
        RawValue::Bytes(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        RawValue::List(items) | RawValue::Set(items) => {
            Value::Array(items.iter().map(|item| convert(item, depth + 1)).collect())
        }
        RawValue::Map(entries) => {
            let mut out = Map::new();
            for (key, item) in entries {
                out.insert(key_string(key), convert(item, depth + 1));
            }
            Value::Object(out)
        }
        RawValue::Json(json) => json.clone(),
        RawValue::Object(obj) => match dump_object(obj.as_ref()) {
            Some(fields) => fields_to_json(&fields, depth),
            None => Value::String(value.display_string()),
        },
        RawValue::Opaque(s) => Value::String(s.clone()),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(f.to_string()))
}

fn key_string(key: &RawValue) -> String {
    match key {
        RawValue::Text(s) | RawValue::Opaque(s) => s.clone(),
        RawValue::Json(Value::String(s)) => s.clone(),
        other => other.display_string(),
    }
}

fn fields_to_json(fields: &FieldMap, depth: usize) -> Value {
    let mut out = Map::new();
    for (name, item) in fields {
        out.insert(name.clone(), convert(item, depth + 1));
    }
    Value::Object(out)
}

/// Canonical dump first, then the attribute set. A panicking implementation
/// counts as unavailable.
fn dump_object(obj: &dyn ResponseFields) -> Option<FieldMap> {
    match catch_unwind(AssertUnwindSafe(|| obj.fields())) {
        Ok(Ok(fields)) => return Some(fields),
        Ok(Err(err)) => {
            tracing::debug!(type_name = obj.type_name(), "field dump failed: {err}");
        }
        Err(_) => {
            tracing::warn!(type_name = obj.type_name(), "field dump panicked");
        }
    }
    match catch_unwind(AssertUnwindSafe(|| obj.attributes())) {
        Ok(attributes) => attributes,
        Err(_) => {
            tracing::warn!(type_name = obj.type_name(), "attribute read panicked");
            None
        }
    }
}

/// Removes every selector key, at any depth.
pub fn strip_selectors(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(key, _)| !SELECTOR_KEYS.contains(&key.as_str()))
                .map(|(key, item)| (key, strip_selectors(item)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_selectors).collect()),
        other => other,
    }
}

/// Answer reported by an `agent_completion` step.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub answer: String,
    pub success: Option<bool>,
}

/// Scans normalized steps for the first completion action with an answer.
pub fn extract_completion(steps: &[Value]) -> Option<Completion> {
    steps.iter().find_map(|step| {
        if step.get("type").and_then(Value::as_str) != Some("agent_completion") {
            return None;
        }
        let action = step.get("value")?.get("action")?;
        if action.get("type").and_then(Value::as_str) != Some("completion") {
            return None;
        }
        let answer = match action.get("answer")? {
            Value::String(s) if !s.is_empty() => s.clone(),
            Value::String(_) | Value::Null | Value::Bool(false) => return None,
            other => other.to_string(),
        };
        Some(Completion {
            answer,
            success: action.get("success").map(|s| s.as_bool().unwrap_or(false)),
        })
    })
}
