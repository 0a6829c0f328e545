//! CBOR conversions between typed values, dynamic values and bytes.

use bytes::Bytes;
use ciborium::Value;
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Serialize a typed value into a dynamic CBOR value.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn to_value<T: Serialize + ?Sized>(value: &T, context: &'static str) -> Result<Value> {
    Value::serialized(value).map_err(|e| Error::Encode {
        context,
        reason: e.to_string(),
    })
}

/// Deserialize a dynamic CBOR value into a typed value.
///
/// Returns the deserializer message on failure so callers can attach the
/// error kind that fits their context.
///
/// # Errors
///
/// Returns the deserializer message if the value has the wrong shape.
pub fn from_value<T: DeserializeOwned>(value: &Value) -> std::result::Result<T, String> {
    value.deserialized().map_err(|e| e.to_string())
}

/// Encode a dynamic value into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the value cannot be serialized.
pub fn encode(value: &Value) -> Result<Bytes> {
    let mut vec = Vec::new();
    ciborium::ser::into_writer(value, &mut vec)?;
    Ok(Bytes::from(vec))
}

/// Decode CBOR bytes into a dynamic value.
///
/// # Errors
///
/// Returns a framing error if the bytes are not exactly one CBOR item.
pub fn decode(data: &[u8]) -> Result<Value> {
    let mut rest = data;
    let value = ciborium::de::from_reader(&mut rest)
        .map_err(|e| Error::Framing(format!("unreadable body: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Framing(format!(
            "trailing bytes after message: {} unread",
            rest.len()
        )));
    }
    Ok(value)
}
