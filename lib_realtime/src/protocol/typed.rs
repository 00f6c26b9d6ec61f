//! Typed payloads.
//!
//! Event, RPC and record-patch payloads travel as a single string whose first
//! character names the type: `S` string, `N` number, `T` true, `F` false,
//! `L` null, `O` JSON object or array, `U` undefined (decoded as null).

use serde_json::Value;

use super::message::ParseError;

/// Encodes a JSON value with its type prefix.
pub fn encode(value: &Value) -> String {
    match value {
        Value::String(s) => format!("S{}", s),
        Value::Number(n) => format!("N{}", n),
        Value::Bool(true) => "T".to_string(),
        Value::Bool(false) => "F".to_string(),
        Value::Null => "L".to_string(),
        Value::Array(_) | Value::Object(_) => format!("O{}", value),
    }
}

/// Decodes a prefixed value.
pub fn decode(raw: &str) -> Result<Value, ParseError> {
    let mut chars = raw.chars();
    let prefix = chars.next().ok_or_else(|| ParseError::InvalidTyped(raw.to_string()))?;
    let rest = chars.as_str();
    match prefix {
        'S' => Ok(Value::String(rest.to_string())),
        'N' => serde_json::from_str::<serde_json::Number>(rest)
            .map(Value::Number)
            .map_err(|_| ParseError::InvalidTyped(raw.to_string())),
        'T' => Ok(Value::Bool(true)),
        'F' => Ok(Value::Bool(false)),
        'L' | 'U' => Ok(Value::Null),
        'O' => serde_json::from_str(rest).map_err(|_| ParseError::InvalidTyped(raw.to_string())),
        _ => Err(ParseError::InvalidTyped(raw.to_string())),
    }
}
