use message_channel::ChannelId;
use rpc_bridge::{PendingCall, ProxyHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, info};

use crate::listeners::Handler;
use crate::{EventRecord, Link, LinkName, ListenerId, ListenerTable, OutboundRequest, ShimError};

/// The real host window. Only Main holds one.
pub trait HostWindow {
    fn window_data(&self) -> WindowData;
    fn close(&mut self);
}

/// Snapshot of host window properties a worker cannot query itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowData {
    pub device_pixel_ratio: f64,
    pub inner_width: u32,
    pub inner_height: u32,
    #[serde(default)]
    pub cordova: bool,
    #[serde(default)]
    pub navigator_standalone: bool,
    #[serde(rename = "__TAURI__", default)]
    pub tauri: bool,
}

impl Default for WindowData {
    fn default() -> Self {
        Self {
            device_pixel_ratio: 1.0,
            inner_width: 816,
            inner_height: 624,
            cordova: false,
            navigator_standalone: false,
            tauri: false,
        }
    }
}

enum Surface {
    Host(Box<dyn HostWindow>),
    Replica(Option<Link>),
}

pub struct WindowShim {
    listeners: ListenerTable,
    data: WindowData,
    surface: Surface,
}

impl WindowShim {
    /// Worker-side shim; effects go through the active link.
    pub fn replica() -> Self {
        Self {
            listeners: ListenerTable::new(),
            data: WindowData::default(),
            surface: Surface::Replica(None),
        }
    }

    /// Main-side shim wrapping the real window.
    pub fn host(host: Box<dyn HostWindow>) -> Self {
        Self {
            listeners: ListenerTable::new(),
            data: host.window_data(),
            surface: Surface::Host(host),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.surface, Surface::Host(_))
    }

    pub fn link(&mut self, handle: ProxyHandle) -> Result<bool, ShimError> {
        match &mut self.surface {
            Surface::Host(_) => Err(ShimError::HostMode {
                name: LinkName::Window,
            }),
            Surface::Replica(slot) => Ok(Link::install(slot, LinkName::Window, handle)),
        }
    }

    pub fn linked_channel(&self) -> Option<ChannelId> {
        match &self.surface {
            Surface::Replica(Some(link)) => Some(link.remote.channel_id()),
            _ => None,
        }
    }

    pub fn unlink(&mut self) {
        if let Surface::Replica(slot) = &mut self.surface {
            if slot.take().is_some() {
                debug!(target: "shim", name = %LinkName::Window, "unlinked");
            }
        }
    }

    pub fn data(&self) -> &WindowData {
        &self.data
    }

    pub fn update_data(&mut self, data: WindowData) {
        debug!(target: "shim", width = data.inner_width, height = data.inner_height, ratio = data.device_pixel_ratio, "window data updated");
        self.data = data;
    }

    /// Refresh the cached data from the host. No-op for a replica.
    pub fn refresh_from_host(&mut self) -> &WindowData {
        if let Surface::Host(host) = &self.surface {
            self.data = host.window_data();
        }
        &self.data
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

    /// Replay one window event. A `resize` carrying `innerWidth`/`innerHeight`
    /// updates the cached size before any listener runs.
    pub fn trigger_event(&mut self, record: &EventRecord) -> usize {
        if record.kind == "resize" {
            if let Some(width) = dimension(record.get("innerWidth")) {
                self.data.inner_width = width;
            }
            if let Some(height) = dimension(record.get("innerHeight")) {
                self.data.inner_height = height;
            }
        }
        self.listeners.dispatch(record)
    }

    /// Replay an untyped payload. Payloads without a string `type` are ignored.
    pub fn trigger_raw(&mut self, payload: Value) -> usize {
        match EventRecord::from_value(payload) {
            Some(record) => self.trigger_event(&record),
            None => {
                debug!(target: "shim", name = %LinkName::Window, "ignoring event without a type");
                0
            }
        }
    }

    /// Close the window. Applied directly on the host; a replica asks Main.
    pub fn close(&mut self) -> Result<Option<PendingCall>, ShimError> {
        match &mut self.surface {
            Surface::Host(host) => {
                info!(target: "shim", "closing host window");
                host.close();
                Ok(None)
            }
            Surface::Replica(slot) => {
                Link::send(slot, LinkName::Window, &OutboundRequest::close()).map(Some)
            }
        }
    }

    pub fn request(&self, request: &OutboundRequest) -> Result<PendingCall, ShimError> {
        match &self.surface {
            Surface::Host(_) => Err(ShimError::HostMode {
                name: LinkName::Window,
            }),
            Surface::Replica(slot) => Link::send(slot, LinkName::Window, request),
        }
    }
}

fn dimension(value: Option<&Value>) -> Option<u32> {
    value
        .and_then(Value::as_u64)
        .and_then(|value| u32::try_from(value).ok())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;

    use message_channel::message_channel;
    use rpc_bridge::{Exposed, IncomingCall, Reply, ServeStatus, expose};
    use serde_json::json;

    use super::*;

    struct FakeHost {
        closed: Rc<Cell<bool>>,
    }

    impl HostWindow for FakeHost {
        fn window_data(&self) -> WindowData {
            WindowData {
                inner_width: 1280,
                inner_height: 720,
                ..WindowData::default()
            }
        }

        fn close(&mut self) {
            self.closed.set(true);
        }
    }

    #[derive(Default)]
    struct RequestSink {
        received: Vec<Value>,
    }

    impl Exposed for RequestSink {
        fn dispatch(&mut self, call: &mut IncomingCall) -> Reply {
            self.received.push(call.args().first().cloned().unwrap_or(Value::Null));
            Reply::unit()
        }
    }

    #[test]
    fn window_data_uses_host_field_names() {
        let data = WindowData {
            tauri: true,
            ..WindowData::default()
        };
        let value = serde_json::to_value(&data).unwrap_or_else(|error| panic!("encode: {error}"));
        assert_eq!(value["devicePixelRatio"], json!(1.0));
        assert_eq!(value["innerWidth"], json!(816));
        assert_eq!(value["__TAURI__"], json!(true));
        let decoded: WindowData = serde_json::from_value(json!({
            "devicePixelRatio": 2.0,
            "innerWidth": 100,
            "innerHeight": 50,
        }))
        .unwrap_or_else(|error| panic!("decode: {error}"));
        assert!(!decoded.cordova);
        assert_eq!(decoded.inner_height, 50);
    }

    #[test]
    fn resize_updates_size_before_listeners_run() {
        let mut shim = WindowShim::replica();
        let seen_width = Rc::new(Cell::new(0));
        let width = seen_width.clone();
        let snapshot = Rc::new(RefCell::new(None));
        let snapshot_slot = snapshot.clone();
        shim.add_event_listener("resize", move |record: &EventRecord| {
            width.set(record.get("innerWidth").and_then(Value::as_u64).unwrap_or(0));
            *snapshot_slot.borrow_mut() = Some(record.kind.clone());
        });

        let invoked = shim.trigger_raw(json!({ "type": "resize", "innerWidth": 640, "innerHeight": 480 }));
        assert_eq!(invoked, 1);
        assert_eq!(seen_width.get(), 640);
        assert_eq!(shim.data().inner_width, 640);
        assert_eq!(shim.data().inner_height, 480);
        assert_eq!(snapshot.borrow().as_deref(), Some("resize"));
    }

    #[test]
    fn untyped_payload_is_ignored() {
        let mut shim = WindowShim::replica();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        shim.add_event_listener("blur", move |_: &EventRecord| flag.set(true));
        assert_eq!(shim.trigger_raw(json!({ "kind": "blur" })), 0);
        assert!(!fired.get());
    }

    #[test]
    fn host_shim_closes_host_directly() {
        let closed = Rc::new(Cell::new(false));
        let mut shim = WindowShim::host(Box::new(FakeHost {
            closed: closed.clone(),
        }));
        assert_eq!(shim.data().inner_width, 1280);
        assert!(matches!(shim.close(), Ok(None)));
        assert!(closed.get());

        let (_, handle) = rpc_bridge::expose_new();
        assert_eq!(
            shim.link(handle),
            Err(ShimError::HostMode {
                name: LinkName::Window
            })
        );
    }

    #[test]
    fn replica_close_without_link_fails() {
        let mut shim = WindowShim::replica();
        assert!(matches!(
            shim.close(),
            Err(ShimError::NotLinked {
                name: LinkName::Window
            })
        ));
    }

    #[test]
    fn replica_close_is_forwarded_through_latest_link() {
        let mut shim = WindowShim::replica();
        let (stale_port, stale_handle) = rpc_bridge::expose_new();
        assert_eq!(shim.link(stale_handle), Ok(false));

        let (main_end, worker_end) = message_channel();
        assert_eq!(shim.link(ProxyHandle::from_port(worker_end)), Ok(true));
        assert_eq!(shim.linked_channel(), Some(main_end.channel_id()));

        let pending = shim
            .close()
            .unwrap_or_else(|error| panic!("close: {error}"))
            .unwrap_or_else(|| panic!("replica close should return a pending call"));

        let mut exposed = expose(main_end);
        let mut sink = RequestSink::default();
        let status = exposed.serve_timeout(&mut sink, Duration::from_secs(5));
        assert_eq!(status, ServeStatus::Open { served: 1 });
        pending
            .wait()
            .unwrap_or_else(|error| panic!("close request: {error}"));
        assert_eq!(sink.received, vec![json!({ "type": "close", "data": {} })]);

        // The replaced link only ever saw the release request.
        let mut stale = stale_port;
        let mut stale_sink = RequestSink::default();
        assert_eq!(
            stale.serve_timeout(&mut stale_sink, Duration::from_secs(5)),
            ServeStatus::Released
        );
        assert!(stale_sink.received.is_empty());
    }

    #[test]
    fn relinked_window_sends_later_traffic_only_to_new_link() {
        let mut shim = WindowShim::replica();
        let (first_main, first_worker) = message_channel();
        let (second_main, second_worker) = message_channel();
        assert_eq!(shim.link(ProxyHandle::from_port(first_worker)), Ok(false));
        assert_eq!(shim.link(ProxyHandle::from_port(second_worker)), Ok(true));
        assert_eq!(shim.linked_channel(), Some(second_main.channel_id()));

        let heard = Rc::new(Cell::new(0));
        let counter = heard.clone();
        shim.add_event_listener("keydown", move |_: &EventRecord| counter.set(counter.get() + 1));
        assert_eq!(shim.trigger_event(&EventRecord::new("keydown")), 1);
        let stalled = shim
            .request(&OutboundRequest::loading_error("img/title.png"))
            .unwrap_or_else(|error| panic!("loading error request: {error}"));
        let recovered = shim
            .request(&OutboundRequest::loading_recovered())
            .unwrap_or_else(|error| panic!("recovered request: {error}"));

        let mut current = expose(second_main);
        let mut current_sink = RequestSink::default();
        while current_sink.received.len() < 2 {
            let status = current.serve_timeout(&mut current_sink, Duration::from_secs(5));
            assert!(matches!(status, ServeStatus::Open { served } if served > 0));
        }
        for call in [stalled, recovered] {
            call.wait()
                .unwrap_or_else(|error| panic!("request through new link: {error}"));
        }
        assert_eq!(current_sink.received[0]["type"], json!("loadingError"));
        assert_eq!(current_sink.received[1]["type"], json!("loadingRecovered"));
        assert_eq!(heard.get(), 1);

        let mut released = expose(first_main);
        let mut released_sink = RequestSink::default();
        assert_eq!(
            released.serve_timeout(&mut released_sink, Duration::from_secs(5)),
            ServeStatus::Released
        );
        assert!(released_sink.received.is_empty());
    }
}
