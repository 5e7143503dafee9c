use super::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Serializes a typed value into an opaque JSON value.
///
/// All user-supplied inputs, outputs, and signal payloads travel through the
/// store as JSON; this is the single conversion point from typed Rust values.
///
/// # Errors
/// Returns `Error::Serialization` if the value cannot be represented as JSON.
pub fn serialize_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::Serialization)
}

/// Deserializes an opaque JSON value into a typed value.
///
/// # Errors
/// Returns `Error::Deserialization` if the JSON does not match `T`.
pub fn deserialize_value<T: DeserializeOwned>(value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(Error::Deserialization)
}
