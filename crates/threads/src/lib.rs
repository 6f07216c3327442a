//! The three execution contexts and the contracts between them.
//!
//! Render and Data each run on their own OS thread and expose one actor
//! object over a message channel. Main stays on the caller's thread
//! ([`MainContext`]), owns the real window, and is the only context that
//! talks to every other one.

mod actor;
mod client;
mod data;
mod main_context;
mod render;
mod throttle;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use actor::{ActorCore, ActorLoop, ActorThread, PendingEvent, Shims, spawn_actor};
pub use client::{ActorClient, DataClient, RenderClient};
pub use data::{AssetError, AssetSource, DataActor, DataSettings, FsAssetSource};
pub use main_context::{MainContext, MainSettings, PumpReport};
pub use render::{
    DATABASE_FILES, Engine, EngineContext, PreloadEngine, RenderActor, RenderSettings,
};
pub use throttle::{DEFAULT_THROTTLE_INTERVAL, DEFAULT_THROTTLED_EVENTS, EventThrottle};

/// Method names shared by the actor interfaces and their clients.
pub mod methods {
    pub const LINK: &str = "link";
    pub const START: &str = "start";
    pub const WINDOW_EVENT_FIRED: &str = "windowEventFired";
    pub const DOCUMENT_EVENT_FIRED: &str = "documentEventFired";
    pub const STATUS: &str = "status";
    pub const TERMINATE: &str = "terminate";

    pub const UPDATE_DATA: &str = "updateData";
    pub const HALT_ENGINE: &str = "haltEngine";
    pub const RESUME_ENGINE: &str = "resumeEngine";

    pub const LOAD_ASSET: &str = "loadAsset";
    pub const RETRY_LOADING: &str = "retryLoading";
    pub const LOADING_STALLED: &str = "loadingStalled";

    /// Main hands Render one end of a channel whose other end Data serves.
    pub const CONNECT_DATA: &str = "connectData";
    pub const ACCEPT_PEER: &str = "acceptPeer";

    pub const GET_WINDOW_DATA: &str = "getWindowData";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Main,
    Render,
    Data,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Main => "main",
            ActorRole::Render => "render",
            ActorRole::Data => "data",
        }
    }
}

impl std::fmt::Display for ActorRole {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorState {
    Created,
    Linked,
    Running,
    Terminated,
}

/// Which host object an event was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStream {
    Window,
    Document,
}

impl From<event_trace::TraceStream> for EventStream {
    fn from(stream: event_trace::TraceStream) -> Self {
        match stream {
            event_trace::TraceStream::Window => EventStream::Window,
            event_trace::TraceStream::Document => EventStream::Document,
        }
    }
}

impl From<EventStream> for event_trace::TraceStream {
    fn from(stream: EventStream) -> Self {
        match stream {
            EventStream::Window => event_trace::TraceStream::Window,
            EventStream::Document => event_trace::TraceStream::Document,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorStatus {
    pub role: ActorRole,
    pub state: ActorState,
    pub window_linked: bool,
    pub document_linked: bool,
    pub buffered_events: usize,
    pub dropped_events: u64,
    pub delivered_events: u64,
    #[serde(default)]
    pub detail: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("spawn {role} thread: {source}")]
    Spawn {
        role: ActorRole,
        #[source]
        source: std::io::Error,
    },
    #[error("{role}.{method} failed: {source}")]
    Call {
        role: ActorRole,
        method: &'static str,
        #[source]
        source: rpc_bridge::CallError,
    },
    #[error("{role}.{method} did not answer within {timeout_ms} ms")]
    Timeout {
        role: ActorRole,
        method: &'static str,
        timeout_ms: u64,
    },
    #[error("{role} thread panicked")]
    Panicked { role: ActorRole },
    #[error("{role} stopped: {source}")]
    Plugin {
        role: ActorRole,
        #[source]
        source: plugin_manager::PluginError,
    },
}
