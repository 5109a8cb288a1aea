//! Recognize flush control signals amid data records.
//!
//! A flush trigger is any JSON object whose `_flush` field is boolean
//! `true`. Detection is structural: field order, surrounding whitespace and
//! any other fields are irrelevant. Everything else is a data record.

use serde::Deserialize;
use serde_json::Value;

use crate::record::{self, Payload};

/// Name of the boolean field that marks a flush trigger.
pub const FLUSH_FIELD: &str = "_flush";
/// The canonical flush trigger body.
pub const FLUSH_TRIGGER: &[u8] = br#"{"_flush":true}"#;

#[derive(Debug, Clone, PartialEq)]
/// The interpretation of one inbound unit.
pub enum Inbound {
    /// A control signal asking for a flush.
    Flush,
    /// A data record to merge.
    Data(Payload),
}

/// Interpret an inbound body.
///
/// The body is parsed once. A flush trigger is recognized first; anything
/// else must have the data record shape.
///
/// # Errors
///
/// Returns an error if the body is not JSON, is not a JSON object, or is an
/// object that does not have the data record shape.
pub fn classify(body: &[u8]) -> Result<Inbound, record::Error> {
    let value: Value = serde_json::from_slice(body)?;
    if is_trigger_value(&value) {
        return Ok(Inbound::Flush);
    }
    if !value.is_object() {
        return Err(record::Error::NotAnObject);
    }
    let payload = Payload::deserialize(value)?;
    Ok(Inbound::Data(payload))
}

/// Whether `body` is a flush trigger. Malformed bodies are not triggers.
#[must_use]
pub fn is_flush_trigger(body: &[u8]) -> bool {
    serde_json::from_slice::<Value>(body).is_ok_and(|value| is_trigger_value(&value))
}

fn is_trigger_value(value: &Value) -> bool {
    value
        .as_object()
        .and_then(|object| object.get(FLUSH_FIELD))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
