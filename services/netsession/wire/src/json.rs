//! Narrow JSON collaborator used by message wrapper types.
//!
//! Message helpers take a `&dyn JsonCodec` explicitly, so an application can
//! swap the serializer per call site without any process-wide state.

use crate::error::WireError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Text <-> JSON value conversion
pub trait JsonCodec: Send + Sync {
    /// Render a JSON value as text
    fn to_json_string(&self, value: &Value) -> Result<String, WireError>;

    /// Parse text into a JSON value
    fn to_json_value(&self, text: &str) -> Result<Value, WireError>;
}

/// Default collaborator backed by `serde_json`
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeJsonCodec {
    pretty: bool,
}

impl SerdeJsonCodec {
    /// Compact output
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl JsonCodec for SerdeJsonCodec {
    fn to_json_string(&self, value: &Value) -> Result<String, WireError> {
        let text = if self.pretty {
            serde_json::to_string_pretty(value)?
        } else {
            serde_json::to_string(value)?
        };
        Ok(text)
    }

    fn to_json_value(&self, text: &str) -> Result<Value, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Serialize any value through `codec`
pub fn to_json_string<T: Serialize>(codec: &dyn JsonCodec, value: &T) -> Result<String, WireError> {
    codec.to_json_string(&serde_json::to_value(value)?)
}

/// Deserialize any value through `codec`
pub fn from_json_str<T: DeserializeOwned>(codec: &dyn JsonCodec, text: &str) -> Result<T, WireError> {
    Ok(serde_json::from_value(codec.to_json_value(text)?)?)
}
