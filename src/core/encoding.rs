//! JSON encoding/decoding of stream records
//!
//! Inputs arrive as one JSON object per line. Values are coerced to the
//! declared field types of the stream; a line carrying the end-of-stream
//! marker decodes to `StreamItem::EndOfStream`.

use crate::core::{Scalar, ScalarType, StreamItem, StreamRecord, StreamType};
use serde_json::{Map, Value};
use thiserror::Error;

/// Key that marks a JSON object as the end-of-stream sentinel.
pub const EOS_MARKER: &str = "__eos__";

/// Reasons a JSON payload cannot become a record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Malformed JSON: {0}")]
    Json(String),

    #[error("Expected a JSON object, got: {0}")]
    NotAnObject(String),

    #[error("Missing required field '{field}' for stream {stream}")]
    MissingField { stream: String, field: String },

    #[error("Field '{field}' expects {expected}, got: {value}")]
    InvalidValue { field: String, expected: ScalarType, value: String },
}

/// Decode one line of a JSON-lines input. Blank lines yield `None`.
pub fn decode_line(line: &str, stream_type: &StreamType) -> Result<Option<StreamItem>, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(&value, stream_type).map(Some)
}

/// Decode raw bytes, as received from a message broker.
pub fn decode_payload(payload: &[u8], stream_type: &StreamType) -> Result<StreamItem, DecodeError> {
    let value: Value =
        serde_json::from_slice(payload).map_err(|e| DecodeError::Json(e.to_string()))?;
    decode_value(&value, stream_type)
}

pub fn decode_value(value: &Value, stream_type: &StreamType) -> Result<StreamItem, DecodeError> {
    let object = value.as_object().ok_or_else(|| DecodeError::NotAnObject(value.to_string()))?;

    if object.get(EOS_MARKER).and_then(Value::as_bool) == Some(true) {
        return Ok(StreamItem::EndOfStream);
    }

    let mut record = StreamRecord::new(&stream_type.name);
    for def in &stream_type.fields {
        match object.get(&def.name) {
            None | Some(Value::Null) => {
                if !def.optional {
                    return Err(DecodeError::MissingField {
                        stream: stream_type.name.clone(),
                        field: def.name.clone(),
                    });
                }
            }
            Some(raw) => {
                let scalar = scalar_from_json(&def.name, raw, def.ty)?;
                record.fields.insert(def.name.clone(), scalar);
            }
        }
    }

    Ok(StreamItem::Record(record))
}

/// Coerce a JSON value to the declared scalar type.
pub fn scalar_from_json(field: &str, raw: &Value, ty: ScalarType) -> Result<Scalar, DecodeError> {
    let invalid =
        || DecodeError::InvalidValue { field: field.to_string(), expected: ty, value: raw.to_string() };

    match ty {
        ScalarType::Int | ScalarType::Timestamp => {
            let v = match raw {
                Value::Number(n) => n.as_i64().or_else(|| {
                    n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64)
                }),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            }
            .ok_or_else(invalid)?;
            Ok(if ty == ScalarType::Timestamp { Scalar::Timestamp(v) } else { Scalar::Int(v) })
        }
        ScalarType::Float => match raw {
            Value::Number(n) => n.as_f64().map(Scalar::Float).ok_or_else(invalid),
            Value::String(s) => s.trim().parse::<f64>().map(Scalar::Float).map_err(|_| invalid()),
            _ => Err(invalid()),
        },
        ScalarType::Str => match raw {
            Value::String(s) => Ok(Scalar::Str(s.clone())),
            Value::Number(n) => Ok(Scalar::Str(n.to_string())),
            Value::Bool(b) => Ok(Scalar::Str(b.to_string())),
            _ => Err(invalid()),
        },
        ScalarType::Bool => match raw {
            Value::Bool(b) => Ok(Scalar::Bool(*b)),
            _ => Err(invalid()),
        },
    }
}

/// Encode a record as `{"stream": ..., "fields": {...}}`.
pub fn encode_record(stream: &str, record: &StreamRecord) -> Value {
    let mut fields = Map::new();
    for (name, scalar) in &record.fields {
        fields.insert(name.clone(), scalar_to_json(scalar));
    }

    let mut object = Map::new();
    object.insert("stream".to_string(), Value::String(stream.to_string()));
    object.insert("fields".to_string(), Value::Object(fields));
    Value::Object(object)
}

/// Encode the end-of-stream sentinel for an output stream.
pub fn encode_eos(stream: &str) -> Value {
    let mut object = Map::new();
    object.insert("stream".to_string(), Value::String(stream.to_string()));
    object.insert(EOS_MARKER.to_string(), Value::Bool(true));
    Value::Object(object)
}

pub fn scalar_to_json(scalar: &Scalar) -> Value {
    match scalar {
        Scalar::Int(v) | Scalar::Timestamp(v) => Value::from(*v),
        // Non-finite floats have no JSON form.
        Scalar::Float(v) => serde_json::Number::from_f64(*v).map_or(Value::Null, Value::Number),
        Scalar::Str(v) => Value::String(v.clone()),
        Scalar::Bool(v) => Value::Bool(*v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speed_type() -> StreamType {
        StreamType::new("Speed")
            .field("time_from", ScalarType::Int)
            .field("time_to", ScalarType::Int)
            .field("speed", ScalarType::Float)
            .optional_field("note", ScalarType::Str)
            .ordered_by("time_from")
    }

    #[test]
    fn test_decode_line_coerces_types() {
        let line = r#"{"time_from": 0, "time_to": 10, "speed": 1}"#;
        let item = decode_line(line, &speed_type()).unwrap().unwrap();

        match item {
            StreamItem::Record(record) => {
                assert_eq!(record.stream, "Speed");
                assert_eq!(record.get("time_from"), Some(&Scalar::Int(0)));
                assert_eq!(record.get("speed"), Some(&Scalar::Float(1.0)));
                assert_eq!(record.get("note"), None);
            }
            StreamItem::EndOfStream => panic!("expected a record"),
        }
    }

    #[test]
    fn test_decode_eos_marker() {
        let item = decode_line(r#"{"__eos__": true}"#, &speed_type()).unwrap();
        assert_eq!(item, Some(StreamItem::EndOfStream));
    }

    #[test]
    fn test_decode_blank_line() {
        assert_eq!(decode_line("   ", &speed_type()).unwrap(), None);
    }

    #[test]
    fn test_decode_missing_required_field() {
        let err = decode_line(r#"{"time_from": 0, "speed": 0.5}"#, &speed_type()).unwrap_err();
        assert_eq!(
            err,
            DecodeError::MissingField { stream: "Speed".to_string(), field: "time_to".to_string() }
        );
    }

    #[test]
    fn test_decode_rejects_fractional_int() {
        let err =
            decode_line(r#"{"time_from": 0.5, "time_to": 1, "speed": 0.5}"#, &speed_type())
                .unwrap_err();
        assert!(matches!(err, DecodeError::InvalidValue { .. }));
    }

    #[test]
    fn test_encode_record_shape() {
        let record = StreamRecord::new("Speed").with("time_from", 0).with("speed", 0.5);
        let value = encode_record("joined", &record);

        assert_eq!(value["stream"], "joined");
        assert_eq!(value["fields"]["time_from"], 0);
        assert_eq!(value["fields"]["speed"], 0.5);
        assert_eq!(encode_eos("joined")[EOS_MARKER], true);
    }
}
