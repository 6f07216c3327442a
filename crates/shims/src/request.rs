use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smol_str::SmolStr;

/// Method Main exposes on its window/document objects for worker requests.
pub const REQUEST_METHOD: &str = "request";

/// A host effect a worker asks Main to perform: `{ type, data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRequest {
    #[serde(rename = "type")]
    pub kind: SmolStr,
    #[serde(default)]
    pub data: Value,
}

impl OutboundRequest {
    pub const CLOSE: &'static str = "close";
    pub const LOADING_ERROR: &'static str = "loadingError";
    pub const LOADING_RECOVERED: &'static str = "loadingRecovered";

    pub fn close() -> Self {
        Self {
            kind: SmolStr::new_static(Self::CLOSE),
            data: json!({}),
        }
    }

    pub fn loading_error(url: &str) -> Self {
        Self {
            kind: SmolStr::new_static(Self::LOADING_ERROR),
            data: json!({ "url": url }),
        }
    }

    pub fn loading_recovered() -> Self {
        Self {
            kind: SmolStr::new_static(Self::LOADING_RECOVERED),
            data: json!({}),
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.data.get("url").and_then(Value::as_str)
    }

    pub fn to_value(&self) -> Value {
        json!({ "type": self.kind.as_str(), "data": self.data })
    }
}
