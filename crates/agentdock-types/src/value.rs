use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Ordered `(name, value)` pairs produced by a structured response object.
pub type FieldMap = Vec<(String, RawValue)>;

/// Structured object returned by a provider SDK or HTTP decoder.
///
/// `fields` is the canonical dump and may fail; `attributes` is the looser
/// fallback used when the dump is unavailable.
pub trait ResponseFields: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &str;

    fn fields(&self) -> anyhow::Result<FieldMap>;

    fn attributes(&self) -> Option<FieldMap> {
        None
    }
}

/// Every shape a provider response may contain before it is made JSON-safe.
#[derive(Debug, Clone)]
pub enum RawValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<RawValue>),
    Set(Vec<RawValue>),
    Map(Vec<(RawValue, RawValue)>),
    Json(Value),
    Object(Arc<dyn ResponseFields>),
    /// Value that can only be displayed.
    Opaque(String),
}

impl RawValue {
    pub fn text(value: impl Into<String>) -> Self {
        RawValue::Text(value.into())
    }

    pub fn object<T: ResponseFields + 'static>(value: T) -> Self {
        RawValue::Object(Arc::new(value))
    }

    pub fn opaque(value: impl fmt::Display) -> Self {
        RawValue::Opaque(value.to_string())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, RawValue)>,
    {
        RawValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| (RawValue::Text(k.into()), v))
                .collect(),
        )
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null) || matches!(self, RawValue::Json(Value::Null))
    }

    /// Best-effort string form used wherever a value cannot be represented
    /// structurally.
    pub fn display_string(&self) -> String {
        match self {
            RawValue::Null => "None".to_string(),
            RawValue::Bool(b) => b.to_string(),
            RawValue::Int(n) => n.to_string(),
            RawValue::UInt(n) => n.to_string(),
            RawValue::Float(f) => f.to_string(),
            RawValue::Text(s) => s.clone(),
            RawValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            RawValue::List(items) | RawValue::Set(items) => format!("{items:?}"),
            RawValue::Map(entries) => format!("{entries:?}"),
            RawValue::Json(value) => value.to_string(),
            RawValue::Object(obj) => format!("<{}>", obj.type_name()),
            RawValue::Opaque(s) => s.clone(),
        }
    }
}

impl From<Value> for RawValue {
    fn from(value: Value) -> Self {
        RawValue::Json(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl From<String> for RawValue {
    fn from(value: String) -> Self {
        RawValue::Text(value)
    }
}

impl From<bool> for RawValue {
    fn from(value: bool) -> Self {
        RawValue::Bool(value)
    }
}

impl From<i64> for RawValue {
    fn from(value: i64) -> Self {
        RawValue::Int(value)
    }
}

impl From<u64> for RawValue {
    fn from(value: u64) -> Self {
        RawValue::UInt(value)
    }
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Float(value)
    }
}

impl<T: Into<RawValue>> From<Option<T>> for RawValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(RawValue::Null)
    }
}

impl<T: Into<RawValue>> From<Vec<T>> for RawValue {
    fn from(value: Vec<T>) -> Self {
        RawValue::List(value.into_iter().map(Into::into).collect())
    }
}
