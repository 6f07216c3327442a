//! Wire schema shared by both ends of an RPC channel.
//!
//! Every exposed interface uses the same four messages. Requests carry a
//! correlation id that the response echoes; the id is the only thing that
//! pairs a response with its call.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;

/// Key of the placeholder object that stands for a transferred port inside
/// call arguments: `{"$transfer": <index into the transfer list>}`.
pub const TRANSFER_MARKER: &str = "$transfer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub u64);

impl std::fmt::Display for CallId {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "call#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcMessage {
    Apply {
        id: CallId,
        method: SmolStr,
        #[serde(default)]
        args: Vec<Value>,
    },
    Release {
        id: CallId,
    },
    Return {
        id: CallId,
        #[serde(default)]
        value: Value,
    },
    Throw {
        id: CallId,
        error: RemoteError,
    },
}

impl RpcMessage {
    pub fn id(&self) -> CallId {
        match self {
            RpcMessage::Apply { id, .. }
            | RpcMessage::Release { id }
            | RpcMessage::Return { id, .. }
            | RpcMessage::Throw { id, .. } => *id,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, RpcMessage::Apply { .. } | RpcMessage::Release { .. })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .unwrap_or_else(|error| panic!("rpc message is always representable as JSON: {error}"))
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(value).map_err(ProtocolError::Malformed)
    }
}

/// Error thrown by the remote side of a call, marshalled by name and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct RemoteError {
    pub name: SmolStr,
    pub message: String,
}

impl RemoteError {
    pub const UNKNOWN_METHOD: &'static str = "UnknownMethod";
    pub const BAD_ARGUMENT: &'static str = "BadArgument";
    pub const NO_REPLY: &'static str = "NoReply";
    pub const INVALID_STATE: &'static str = "InvalidState";

    pub fn new(name: impl Into<SmolStr>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::UNKNOWN_METHOD, format!("no exposed method named '{method}'"))
    }

    pub fn bad_argument(index: usize, detail: impl std::fmt::Display) -> Self {
        Self::new(Self::BAD_ARGUMENT, format!("argument {index}: {detail}"))
    }

    pub fn no_reply(method: &str) -> Self {
        Self::new(Self::NO_REPLY, format!("'{method}' finished without a reply"))
    }

    pub fn invalid_state(detail: impl Into<String>) -> Self {
        Self::new(Self::INVALID_STATE, detail)
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed rpc message: {0}")]
    Malformed(#[source] serde_json::Error),
}

pub fn transfer_marker(index: usize) -> Value {
    let mut marker = Map::new();
    marker.insert(TRANSFER_MARKER.to_owned(), Value::from(index));
    Value::Object(marker)
}

/// Index into the transfer list if `value` is a transfer placeholder.
pub fn transfer_index(value: &Value) -> Option<usize> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    let index = object.get(TRANSFER_MARKER)?.as_u64()?;
    usize::try_from(index).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn apply_uses_tagged_wire_shape() {
        let message = RpcMessage::Apply {
            id: CallId(7),
            method: SmolStr::new("link"),
            args: vec![json!("window"), transfer_marker(0)],
        };
        assert_eq!(
            message.to_value(),
            json!({
                "type": "APPLY",
                "id": 7,
                "method": "link",
                "args": ["window", { "$transfer": 0 }],
            })
        );
    }

    #[test]
    fn throw_decodes_remote_error() {
        let message = RpcMessage::from_value(json!({
            "type": "THROW",
            "id": 3,
            "error": { "name": "NoReply", "message": "gone" },
        }))
        .unwrap_or_else(|error| panic!("decode throw: {error}"));
        assert_eq!(message.id(), CallId(3));
        assert!(!message.is_request());
        match message {
            RpcMessage::Throw { error, .. } => assert!(error.is(RemoteError::NO_REPLY)),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn return_without_value_decodes_as_null() {
        let message = RpcMessage::from_value(json!({ "type": "RETURN", "id": 1 }))
            .unwrap_or_else(|error| panic!("decode return: {error}"));
        assert_eq!(
            message,
            RpcMessage::Return {
                id: CallId(1),
                value: Value::Null,
            }
        );
    }

    #[test]
    fn malformed_message_is_rejected() {
        assert!(RpcMessage::from_value(json!({ "type": "GET", "id": 1 })).is_err());
        assert!(RpcMessage::from_value(json!("APPLY")).is_err());
    }

    #[test]
    fn transfer_marker_is_recognised_only_in_exact_shape() {
        assert_eq!(transfer_index(&transfer_marker(2)), Some(2));
        assert_eq!(transfer_index(&json!({ "$transfer": 1, "other": true })), None);
        assert_eq!(transfer_index(&json!({ "$transfer": "1" })), None);
        assert_eq!(transfer_index(&json!(1)), None);
    }
}
