use message_channel::ChannelId;
use rpc_bridge::{PendingCall, ProxyHandle};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::debug;

use crate::listeners::Handler;
use crate::{EventRecord, Link, LinkName, ListenerId, ListenerTable, OutboundRequest, ShimError};

/// Worker-side `document`. Holds listeners and at most one link to Main.
#[derive(Debug, Default)]
pub struct DocumentShim {
    listeners: ListenerTable,
    link: Option<Link>,
}

impl DocumentShim {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&mut self, handle: ProxyHandle) -> bool {
        Link::install(&mut self.link, LinkName::Document, handle)
    }

    pub fn linked_channel(&self) -> Option<ChannelId> {
        self.link.as_ref().map(|link| link.remote.channel_id())
    }

    pub fn add_event_listener(
        &mut self,
        kind: impl Into<SmolStr>,
        handler: impl FnMut(&EventRecord) + 'static,
    ) -> ListenerId {
        let boxed: Handler = Box::new(handler);
        self.listeners.add(kind, boxed)
    }

    pub fn remove_event_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn listeners(&self) -> &ListenerTable {
        &self.listeners
    }

    pub fn trigger_event(&mut self, record: &EventRecord) -> usize {
        self.listeners.dispatch(record)
    }

    pub fn trigger_raw(&mut self, payload: Value) -> usize {
        match EventRecord::from_value(payload) {
            Some(record) => self.trigger_event(&record),
            None => {
                debug!(target: "shim", name = %LinkName::Document, "ignoring event without a type");
                0
            }
        }
    }

    pub fn request(&self, request: &OutboundRequest) -> Result<PendingCall, ShimError> {
        Link::send(&self.link, LinkName::Document, request)
    }
}
