use std::ops::Deref;

use plugin_manager::PluginRecord;
use rpc_bridge::{PendingCall, ProxyHandle, Remote, TypedCall};
use serde_json::{Value, json};
use shims::{EventRecord, LinkName, WindowData};

use crate::{ActorRole, ActorStatus, methods};

/// A caller's view of one worker actor.
#[derive(Debug)]
pub struct ActorClient {
    role: ActorRole,
    remote: Remote,
}

impl ActorClient {
    pub fn new(role: ActorRole, remote: Remote) -> Self {
        Self { role, remote }
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn remote(&self) -> &Remote {
        &self.remote
    }

    pub fn link(&self, name: LinkName, handle: ProxyHandle) -> TypedCall<()> {
        TypedCall::new(
            self.remote
                .call_with_proxies(methods::LINK, vec![json!(name.as_str())], vec![handle]),
        )
    }

    pub fn start(&self) -> TypedCall<()> {
        self.remote.typed(methods::START, Vec::new())
    }

    pub fn window_event_fired(&self, record: &EventRecord) -> PendingCall {
        self.event_fired(methods::WINDOW_EVENT_FIRED, record)
    }

    pub fn document_event_fired(&self, record: &EventRecord) -> PendingCall {
        self.event_fired(methods::DOCUMENT_EVENT_FIRED, record)
    }

    fn event_fired(&self, method: &str, record: &EventRecord) -> PendingCall {
        self.remote
            .call(method, vec![json!(record.kind.as_str()), record.data()])
    }

    pub fn status(&self) -> TypedCall<ActorStatus> {
        self.remote.typed(methods::STATUS, Vec::new())
    }

    pub fn terminate(&self) -> TypedCall<()> {
        self.remote.typed(methods::TERMINATE, Vec::new())
    }
}

#[derive(Debug)]
pub struct RenderClient {
    inner: ActorClient,
}

impl RenderClient {
    pub fn new(remote: Remote) -> Self {
        Self {
            inner: ActorClient::new(ActorRole::Render, remote),
        }
    }

    pub fn update_window_data(&self, data: &WindowData) -> TypedCall<()> {
        self.update_data("window", json!(data))
    }

    pub fn update_plugins(&self, plugins: &[PluginRecord]) -> TypedCall<()> {
        self.update_data("plugins", json!(plugins))
    }

    fn update_data(&self, kind: &str, payload: Value) -> TypedCall<()> {
        self.inner
            .remote
            .typed(methods::UPDATE_DATA, vec![json!(kind), payload])
    }

    pub fn halt_engine(&self, url: &str) -> TypedCall<()> {
        self.inner
            .remote
            .typed(methods::HALT_ENGINE, vec![json!(url)])
    }

    pub fn resume_engine(&self) -> TypedCall<()> {
        self.inner.remote.typed(methods::RESUME_ENGINE, Vec::new())
    }

    /// Hand Render its proxy to Data's asset interface.
    pub fn connect_data(&self, handle: ProxyHandle) -> TypedCall<()> {
        TypedCall::new(
            self.inner
                .remote
                .call_with_proxies(methods::CONNECT_DATA, Vec::new(), vec![handle]),
        )
    }
}

impl Deref for RenderClient {
    type Target = ActorClient;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[derive(Debug)]
pub struct DataClient {
    inner: ActorClient,
}

impl DataClient {
    pub fn new(remote: Remote) -> Self {
        Self {
            inner: ActorClient::new(ActorRole::Data, remote),
        }
    }

    /// Resolves once the asset loads, possibly after retries.
    pub fn load_asset(&self, path: &str) -> PendingCall {
        self.inner.remote.call(methods::LOAD_ASSET, vec![json!(path)])
    }

    /// Number of stalled resources that were reloaded.
    pub fn retry_loading(&self) -> TypedCall<usize> {
        self.inner.remote.typed(methods::RETRY_LOADING, Vec::new())
    }

    pub fn loading_stalled(&self) -> PendingCall {
        self.inner.remote.call(methods::LOADING_STALLED, Vec::new())
    }

    /// Have Data serve asset requests arriving on `handle`'s channel.
    pub fn accept_peer(&self, handle: ProxyHandle) -> TypedCall<()> {
        TypedCall::new(
            self.inner
                .remote
                .call_with_proxies(methods::ACCEPT_PEER, Vec::new(), vec![handle]),
        )
    }
}

impl Deref for DataClient {
    type Target = ActorClient;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
