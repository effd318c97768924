//! Function wrappers for deserializing and serializing gateway payloads.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Parsing a payload as JSON failed.
#[derive(Debug)]
pub struct PayloadParsingError {
    kind: PayloadParsingErrorType,
    source: Option<Box<dyn Error + Send + Sync>>,
}

impl PayloadParsingError {
    /// Immutable reference to the type of error that occurred.
    pub const fn kind(&self) -> &PayloadParsingErrorType {
        &self.kind
    }
}

impl Display for PayloadParsingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.kind {
            PayloadParsingErrorType::Deserializing => {
                f.write_str("deserializing payload as json failed")
            }
            PayloadParsingErrorType::NotUtf8 => f.write_str("payload was not valid utf-8"),
            PayloadParsingErrorType::NotAnObject => {
                f.write_str("decoded json value was not an object")
            }
        }
    }
}

impl Error for PayloadParsingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| &**source as &(dyn Error + 'static))
    }
}

/// Type of [`PayloadParsingError`] that occurred.
#[derive(Debug)]
#[non_exhaustive]
pub enum PayloadParsingErrorType {
    /// Deserializing the payload from JSON failed.
    Deserializing,
    /// The payload was not valid UTF-8.
    NotUtf8,
    /// The decoded JSON value was not an object.
    ///
    /// Per spec, a frame whose top-level value isn't a JSON object is a
    /// protocol violation, not a recoverable parse failure.
    NotAnObject,
}

/// Deserialize a complete frame object (`op`/`d`/`s`/`t`) from raw bytes.
///
/// # Errors
///
/// Returns [`PayloadParsingErrorType::NotUtf8`] if `bytes` isn't valid UTF-8.
///
/// Returns [`PayloadParsingErrorType::Deserializing`] if the bytes don't
/// parse as JSON at all.
///
/// Returns [`PayloadParsingErrorType::NotAnObject`] if the parsed JSON value
/// is not an object (e.g. an array or scalar).
pub fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PayloadParsingError> {
    let text = std::str::from_utf8(bytes).map_err(|source| PayloadParsingError {
        kind: PayloadParsingErrorType::NotUtf8,
        source: Some(Box::new(source)),
    })?;

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|source| PayloadParsingError {
            kind: PayloadParsingErrorType::Deserializing,
            source: Some(Box::new(source)),
        })?;

    if !value.is_object() {
        tracing::error!("decoded payload is not a json object: {text}");

        return Err(PayloadParsingError {
            kind: PayloadParsingErrorType::NotAnObject,
            source: None,
        });
    }

    serde_json::from_value(value).map_err(|source| PayloadParsingError {
        kind: PayloadParsingErrorType::Deserializing,
        source: Some(Box::new(source)),
    })
}

/// Serialize a command as a compact JSON byte vector.
///
/// # Errors
///
/// Returns an error if serialization fails, which should only happen for
/// values containing non-finite floats or non-string map keys.
pub fn to_vec(value: &impl Serialize) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    use super::{from_slice, PayloadParsingErrorType};
    use serde_json::Value;
    use static_assertions::assert_impl_all;
    use std::{error::Error, fmt::Debug};

    assert_impl_all!(PayloadParsingErrorType: Debug, Send, Sync);
    assert_impl_all!(super::PayloadParsingError: Error, Send, Sync);

    #[test]
    fn object_round_trips() {
        let value: Value = from_slice(br#"{"op":10,"d":{}}"#).unwrap();
        assert_eq!(value["op"], 10);
    }

    #[test]
    fn array_is_rejected() {
        let err = from_slice::<Value>(b"[]").unwrap_err();
        assert!(matches!(err.kind(), PayloadParsingErrorType::NotAnObject));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let err = from_slice::<Value>(&[0xff, 0xfe, 0xfd]).unwrap_err();
        assert!(matches!(err.kind(), PayloadParsingErrorType::NotUtf8));
    }
}
