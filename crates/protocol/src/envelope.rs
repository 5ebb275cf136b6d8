use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::types::CommandKind;

/// Sub-command carried by a COMMAND frame towards the hub.
///
/// `data` stays raw until the handler for `action` knows its type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCommand {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl SubCommand {
    /// Creates a sub-command with an optional typed body.
    pub fn new<T: Serialize>(
        action: impl Into<String>,
        data: Option<&T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            action: action.into(),
            data: data.map(|d| to_raw(d)).transpose()?,
        })
    }

    /// Parses a sub-command from frame bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Deserializes `data` into `T`; a missing body decodes from `null`.
    pub fn parse_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        match &self.data {
            Some(raw) => serde_json::from_str(raw.get()),
            None => serde_json::from_str("null"),
        }
    }

    /// Serializes to COMMAND frame bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Queued command delivered from the hub to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    #[serde(rename = "deviceid")]
    pub device_id: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CommandKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<Box<RawValue>>,
}

impl CommandEnvelope {
    /// Parses an envelope from frame bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serializes to COMMAND frame bytes.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Raw argument JSON (`null` when absent).
    pub fn argument_json(&self) -> &str {
        self.argument.as_deref().map(RawValue::get).unwrap_or("null")
    }
}

/// Serializes `value` into a boxed [`RawValue`].
pub fn to_raw<T: Serialize + ?Sized>(value: &T) -> Result<Box<RawValue>, serde_json::Error> {
    RawValue::from_string(serde_json::to_string(value)?)
}

/// Wraps an already-serialized JSON string, rejecting invalid JSON.
pub fn raw_from_str(json: &str) -> Result<Box<RawValue>, serde_json::Error> {
    RawValue::from_string(json.to_string())
}
