//! Core data structures and types for the Confluence stream-join engine

use std::collections::BTreeMap;
use std::fmt;

/// Scalar types a stream field may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Int,
    Float,
    Str,
    Bool,
    /// Milliseconds since epoch, stored as a signed integer.
    Timestamp,
}

impl ScalarType {
    pub fn is_numeric(self) -> bool {
        matches!(self, ScalarType::Int | ScalarType::Float | ScalarType::Timestamp)
    }

    /// Parse the type keyword used in topology declarations.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_uppercase().as_str() {
            "INT" | "INTEGER" => Some(ScalarType::Int),
            "FLOAT" | "DOUBLE" => Some(ScalarType::Float),
            "STRING" | "TEXT" => Some(ScalarType::Str),
            "BOOL" | "BOOLEAN" => Some(ScalarType::Bool),
            "TIMESTAMP" => Some(ScalarType::Timestamp),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Int => "INT",
            ScalarType::Float => "FLOAT",
            ScalarType::Str => "STRING",
            ScalarType::Bool => "BOOL",
            ScalarType::Timestamp => "TIMESTAMP",
        };
        f.write_str(name)
    }
}

/// A single field value carried by a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Timestamp(i64),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Int(_) => ScalarType::Int,
            Scalar::Float(_) => ScalarType::Float,
            Scalar::Str(_) => ScalarType::Str,
            Scalar::Bool(_) => ScalarType::Bool,
            Scalar::Timestamp(_) => ScalarType::Timestamp,
        }
    }

    /// Integer view used for ordering fields. Floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) | Scalar::Timestamp(v) => Some(*v),
            Scalar::Float(v) if v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) | Scalar::Timestamp(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Int(v) | Scalar::Timestamp(v) => write!(f, "{}", v),
            Scalar::Float(v) => write!(f, "{}", v),
            Scalar::Str(v) => write!(f, "'{}'", v),
            Scalar::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Scalar {
    fn from(v: i64) -> Self {
        Scalar::Int(v)
    }
}

impl From<i32> for Scalar {
    fn from(v: i32) -> Self {
        Scalar::Int(i64::from(v))
    }
}

impl From<f64> for Scalar {
    fn from(v: f64) -> Self {
        Scalar::Float(v)
    }
}

impl From<bool> for Scalar {
    fn from(v: bool) -> Self {
        Scalar::Bool(v)
    }
}

impl From<&str> for Scalar {
    fn from(v: &str) -> Self {
        Scalar::Str(v.to_string())
    }
}

impl From<String> for Scalar {
    fn from(v: String) -> Self {
        Scalar::Str(v)
    }
}

/// Declared field of a stream type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub ty: ScalarType,
    pub optional: bool,
}

/// Schema of one class of records, e.g. `Location{time, x, y}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamType {
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// Field whose value drives event time for this stream.
    pub order_field: Option<String>,
}

impl StreamType {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), fields: Vec::new(), order_field: None }
    }

    /// Add a required field.
    pub fn field(mut self, name: &str, ty: ScalarType) -> Self {
        self.fields.push(FieldDef { name: name.to_string(), ty, optional: false });
        self
    }

    /// Add a field that record instances may omit.
    pub fn optional_field(mut self, name: &str, ty: ScalarType) -> Self {
        self.fields.push(FieldDef { name: name.to_string(), ty, optional: true });
        self
    }

    pub fn ordered_by(mut self, field: &str) -> Self {
        self.order_field = Some(field.to_string());
        self
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_def(name).is_some()
    }
}

/// One record of a stream type: field values plus the bookkeeping the engine
/// attaches on ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub stream: String,
    pub fields: BTreeMap<String, Scalar>,
    /// Arrival sequence number, assigned by the engine.
    pub sequence: u64,
    /// Value of the stream's ordering field, resolved by the engine.
    pub timestamp: Option<i64>,
}

impl StreamRecord {
    pub fn new(stream: &str) -> Self {
        Self { stream: stream.to_string(), fields: BTreeMap::new(), sequence: 0, timestamp: None }
    }

    /// Builder-style field setter.
    pub fn with<V: Into<Scalar>>(mut self, name: &str, value: V) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn set<V: Into<Scalar>>(&mut self, name: &str, value: V) {
        self.fields.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Scalar> {
        self.fields.get(name)
    }
}

impl fmt::Display for StreamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.stream)?;
        for (i, (name, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        write!(f, ")")
    }
}

/// What a stream delivers: a record or the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Record(StreamRecord),
    EndOfStream,
}

impl From<StreamRecord> for StreamItem {
    fn from(record: StreamRecord) -> Self {
        StreamItem::Record(record)
    }
}

pub mod encoding;
pub use encoding::*;
