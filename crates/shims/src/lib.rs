//! Stand-ins for the host `window` and `document` inside a worker context.
//!
//! Engine code registers listeners on a shim exactly as it would on the real
//! object. Main observes the real events and replays them into the shim with
//! [`WindowShim::trigger_event`] / [`DocumentShim::trigger_event`]. Effects
//! that need the real host (closing the window) travel back to Main as
//! [`OutboundRequest`]s over the shim's active [`Link`].

mod document;
mod listeners;
mod request;
mod window;

use std::str::FromStr;

use rpc_bridge::{PendingCall, ProxyHandle, Remote, wrap};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use smol_str::SmolStr;
use tracing::debug;

pub use document::DocumentShim;
pub use listeners::{ListenerEntry, ListenerTable};
pub use request::{OutboundRequest, REQUEST_METHOD};
pub use window::{HostWindow, WindowData, WindowShim};

/// One observed window or document event: `{ type, ...payload }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: SmolStr,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl EventRecord {
    pub fn new(kind: impl Into<SmolStr>) -> Self {
        Self {
            kind: kind.into(),
            payload: Map::new(),
        }
    }

    /// Build a record from the `(type, data)` pair a forwarding call carries.
    /// Object data becomes the payload; anything else is kept under `detail`.
    pub fn from_parts(kind: impl Into<SmolStr>, data: Value) -> Self {
        let payload = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_owned(), other);
                map
            }
        };
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// `None` when `value` is not an object with a string `type`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut payload) = value else {
            return None;
        };
        let Some(Value::String(kind)) = payload.remove("type") else {
            return None;
        };
        Some(Self {
            kind: SmolStr::from(kind),
            payload,
        })
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_owned(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn data(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    pub fn to_value(&self) -> Value {
        let mut object = self.payload.clone();
        object.insert("type".to_owned(), Value::String(self.kind.to_string()));
        Value::Object(object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkName {
    Window,
    Document,
}

impl LinkName {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkName::Window => "window",
            LinkName::Document => "document",
        }
    }
}

impl std::fmt::Display for LinkName {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl FromStr for LinkName {
    type Err = ShimError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "window" => Ok(LinkName::Window),
            "document" => Ok(LinkName::Document),
            other => Err(ShimError::UnknownLink {
                name: other.to_owned(),
            }),
        }
    }
}

/// The active proxy a worker shim forwards host effects through.
#[derive(Debug)]
pub struct Link {
    pub name: LinkName,
    pub remote: Remote,
}

impl Link {
    /// Wrap `handle` into `slot`, replacing (and releasing) any earlier link.
    /// Returns whether an earlier link was replaced.
    pub(crate) fn install(slot: &mut Option<Link>, name: LinkName, handle: ProxyHandle) -> bool {
        let channel = handle.channel_id();
        let previous = slot.replace(Link {
            name,
            remote: wrap(handle),
        });
        match previous {
            Some(previous) => {
                debug!(target: "shim", %name, old = %previous.remote.channel_id(), new = %channel, "link replaced");
                // The old proxy is dropped right after, so its acknowledgement is not awaited.
                let _ = previous.remote.release();
                true
            }
            None => {
                debug!(target: "shim", %name, %channel, "linked");
                false
            }
        }
    }

    pub(crate) fn send(
        slot: &Option<Link>,
        name: LinkName,
        request: &OutboundRequest,
    ) -> Result<PendingCall, ShimError> {
        let link = slot.as_ref().ok_or(ShimError::NotLinked { name })?;
        debug!(target: "shim", %name, kind = %request.kind, "outbound request");
        Ok(link.remote.call(REQUEST_METHOD, vec![request.to_value()]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShimError {
    #[error("{name} shim has no active link")]
    NotLinked { name: LinkName },
    #[error("{name} shim drives the host directly and cannot be linked")]
    HostMode { name: LinkName },
    #[error("unknown link name '{name}'")]
    UnknownLink { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_record_parses_typed_payload() {
        let record = EventRecord::from_value(json!({ "type": "keydown", "keyCode": 13 }))
            .unwrap_or_else(|| panic!("keydown should parse"));
        assert_eq!(record.kind, "keydown");
        assert_eq!(record.get("keyCode"), Some(&json!(13)));
        assert_eq!(record.to_value(), json!({ "type": "keydown", "keyCode": 13 }));
    }

    #[test]
    fn event_record_without_string_type_is_rejected() {
        assert!(EventRecord::from_value(json!({ "keyCode": 13 })).is_none());
        assert!(EventRecord::from_value(json!({ "type": 4 })).is_none());
        assert!(EventRecord::from_value(json!("keydown")).is_none());
    }

    #[test]
    fn from_parts_keeps_non_object_data_as_detail() {
        let record = EventRecord::from_parts("blur", Value::Null);
        assert!(record.payload.is_empty());
        let record = EventRecord::from_parts("custom", json!(3));
        assert_eq!(record.get("detail"), Some(&json!(3)));
    }

    #[test]
    fn link_names_parse() {
        assert_eq!("window".parse::<LinkName>(), Ok(LinkName::Window));
        assert_eq!("document".parse::<LinkName>(), Ok(LinkName::Document));
        assert_eq!(
            "canvas".parse::<LinkName>(),
            Err(ShimError::UnknownLink {
                name: "canvas".to_owned()
            })
        );
    }
}
