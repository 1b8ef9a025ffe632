use serde::{de, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Wraps [ciborium::Value] so packets can be inspected without knowing their
/// concrete type.
///
/// Also, useful in future if we want to change the CBOR library.
#[derive(Debug, Clone, PartialEq)]
pub struct Value(pub ciborium::Value);

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
}

impl std::ops::Deref for Value {
    type Target = ciborium::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    ciborium::from_reader(Cursor::new(slice)).map_err(|e| CborError::DecodeFailed(e.to_string()))
}

/// Decode arbitrary CBOR without a target type.
pub fn to_value(slice: &[u8]) -> Result<Value, CborError> {
    from_slice::<ciborium::Value>(slice).map(Value)
}
