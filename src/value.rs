use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::script::TaskDefaults;
use crate::structured::StructuredTaskResult;

/// Plain data produced by tasks and carried by literals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(Float),
    Str(String),
    Path(Utf8PathBuf),
    Uuid(Uuid),
    Enum(EnumValue),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A result that is not fully computed, see [`StructuredTaskResult`].
    Structured(Arc<StructuredTaskResult>),
    Defaults(TaskDefaults),
}

/// Coarse kind of a [`Value`], used by instance-of change detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Path,
    Uuid,
    Enum,
    List,
    Map,
    Structured,
    Defaults,
}

/// `f64` with bitwise equality so that values can key identifiers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Float(pub f64);

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Float {}

impl Hash for Float {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumValue {
    pub ty: String,
    pub variant: String,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Str(_) => ValueKind::Str,
            Value::Path(_) => ValueKind::Path,
            Value::Uuid(_) => ValueKind::Uuid,
            Value::Enum(_) => ValueKind::Enum,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Structured(_) => ValueKind::Structured,
            Value::Defaults(_) => ValueKind::Defaults,
        }
    }

    /// Values of immutable scalar kinds, which are identified by their value alone
    /// and can be re-wrapped as fresh literals.
    pub fn is_unique_literal(&self) -> bool {
        matches!(
            self,
            Value::Null
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Str(_)
                | Value::Path(_)
                | Value::Uuid(_)
                | Value::Enum(_)
        )
    }

    /// String form used for map keys, qualifiers and string concatenation.
    /// `None` for null.
    pub fn to_key_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    /// Script truthiness: null is false, booleans are themselves, everything
    /// else is the string form parsed as a boolean.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            other => other.to_string().eq_ignore_ascii_case("true"),
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredTaskResult> {
        match self {
            Value::Structured(structured) => Some(structured),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{:?}", x.0),
            Value::Str(s) => f.write_str(s),
            Value::Path(p) => write!(f, "{p}"),
            Value::Uuid(u) => write!(f, "{}", u.hyphenated()),
            Value::Enum(e) => f.write_str(&e.variant),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(entries) => {
                f.write_str("{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{key}={item}")?;
                }
                f.write_str("}")
            }
            Value::Structured(structured) => write!(f, "{structured}"),
            Value::Defaults(_) => f.write_str("<task defaults>"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(Float(value))
    }
}

impl From<Utf8PathBuf> for Value {
    fn from(value: Utf8PathBuf) -> Self {
        Value::Path(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<StructuredTaskResult> for Value {
    fn from(value: StructuredTaskResult) -> Self {
        Value::Structured(Arc::new(value))
    }
}
