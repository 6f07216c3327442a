use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded, select};
use message_channel::{ChannelId, Envelope, Port, PortReceiver, PortSender};
use rpc_protocol::{CallId, RemoteError, RpcMessage, transfer_marker};
use serde::de::DeserializeOwned;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, trace, warn};

use crate::ProxyHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("channel {channel} closed before '{method}' returned")]
    ChannelClosed { channel: ChannelId, method: SmolStr },
    #[error("proxy on channel {channel} was released")]
    Released { channel: ChannelId },
    #[error("remote threw {0}")]
    Remote(#[from] RemoteError),
    #[error("could not decode result of '{method}': {detail}")]
    Decode { method: SmolStr, detail: String },
}

type Completion = Result<Value, CallError>;

struct PendingEntry {
    method: SmolStr,
    completion: Sender<Completion>,
}

#[derive(Default)]
struct PendingTable {
    calls: HashMap<CallId, PendingEntry>,
    closed: bool,
}

struct RemoteShared {
    channel: ChannelId,
    pending: Mutex<PendingTable>,
}

impl RemoteShared {
    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        // A poisoned table only means a completion sender panicked; the map is still consistent.
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(&self, id: CallId, completion: Completion) {
        let entry = self.lock().calls.remove(&id);
        match entry {
            Some(entry) => {
                trace!(target: "rpc", channel = %self.channel, call = %id, method = %entry.method, "completed");
                let _ = entry.completion.send(completion);
            }
            None => {
                warn!(target: "rpc", channel = %self.channel, call = %id, "response for unknown call");
            }
        }
    }

    fn fail_all(&self) {
        let drained: Vec<(CallId, PendingEntry)> = {
            let mut table = self.lock();
            table.closed = true;
            table.calls.drain().collect()
        };
        for (id, entry) in drained {
            debug!(target: "rpc", channel = %self.channel, call = %id, method = %entry.method, "failing call, channel closed");
            let _ = entry.completion.send(Err(CallError::ChannelClosed {
                channel: self.channel,
                method: entry.method,
            }));
        }
    }
}

/// Caller-side proxy for an object exposed on the other end of a channel.
pub struct Remote {
    shared: Arc<RemoteShared>,
    sender: PortSender,
    next_call_id: AtomicU64,
    released: AtomicBool,
    shutdown: Option<Sender<()>>,
    reader: Option<JoinHandle<()>>,
}

pub fn wrap(handle: ProxyHandle) -> Remote {
    let (sender, receiver) = handle.into_port().split();
    let channel = sender.channel_id();
    let shared = Arc::new(RemoteShared {
        channel,
        pending: Mutex::new(PendingTable::default()),
    });
    let (shutdown_sender, shutdown_receiver) = bounded::<()>(0);
    let reader_shared = shared.clone();
    let reader = thread::Builder::new()
        .name(format!("rpc-reader-{}", channel.0))
        .spawn(move || read_responses(reader_shared, receiver, shutdown_receiver))
        .unwrap_or_else(|error| panic!("spawn rpc reader thread for {channel}: {error}"));

    Remote {
        shared,
        sender,
        next_call_id: AtomicU64::new(1),
        released: AtomicBool::new(false),
        shutdown: Some(shutdown_sender),
        reader: Some(reader),
    }
}

fn read_responses(shared: Arc<RemoteShared>, receiver: PortReceiver, shutdown: Receiver<()>) {
    loop {
        select! {
            recv(receiver.as_receiver()) -> envelope => {
                let Ok(envelope) = envelope else {
                    break;
                };
                route_response(&shared, envelope);
            }
            recv(shutdown) -> _ => break,
        }
    }
    shared.fail_all();
}

fn route_response(shared: &RemoteShared, envelope: Envelope) {
    match RpcMessage::from_value(envelope.data) {
        Ok(RpcMessage::Return { id, value }) => shared.complete(id, Ok(value)),
        Ok(RpcMessage::Throw { id, error }) => shared.complete(id, Err(CallError::Remote(error))),
        Ok(request) => {
            warn!(target: "rpc", channel = %shared.channel, call = %request.id(), "request arrived on a wrapped port");
        }
        Err(error) => {
            warn!(target: "rpc", channel = %shared.channel, %error, "dropping malformed response");
        }
    }
}

impl Remote {
    pub fn channel_id(&self) -> ChannelId {
        self.shared.channel
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.lock().calls.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.send_request(method, args, Vec::new())
    }

    /// Call with proxies appended to `args` as transfer placeholders.
    pub fn call_with_proxies(
        &self,
        method: &str,
        mut args: Vec<Value>,
        proxies: Vec<ProxyHandle>,
    ) -> PendingCall {
        let transfer: Vec<Port> = proxies.into_iter().map(ProxyHandle::into_port).collect();
        args.extend((0..transfer.len()).map(transfer_marker));
        self.send_request(method, args, transfer)
    }

    pub fn typed<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> TypedCall<T> {
        TypedCall::new(self.call(method, args))
    }

    /// Ask the exposing side to stop serving this channel.
    pub fn release(&self) -> PendingCall {
        if self.released.swap(true, Ordering::AcqRel) {
            return PendingCall::failed(
                CallId(0),
                self.shared.channel,
                SmolStr::new_static("release"),
                CallError::Released {
                    channel: self.shared.channel,
                },
            );
        }
        let id = self.allocate_call_id();
        self.post_tracked(id, SmolStr::new_static("release"), RpcMessage::Release { id }, Vec::new())
    }

    fn send_request(&self, method: &str, args: Vec<Value>, transfer: Vec<Port>) -> PendingCall {
        let method = SmolStr::new(method);
        if self.is_released() {
            return PendingCall::failed(
                CallId(0),
                self.shared.channel,
                method,
                CallError::Released {
                    channel: self.shared.channel,
                },
            );
        }
        let id = self.allocate_call_id();
        let message = RpcMessage::Apply {
            id,
            method: method.clone(),
            args,
        };
        self.post_tracked(id, method, message, transfer)
    }

    fn post_tracked(
        &self,
        id: CallId,
        method: SmolStr,
        message: RpcMessage,
        transfer: Vec<Port>,
    ) -> PendingCall {
        let (completion_sender, completion_receiver) = bounded(1);
        {
            let mut table = self.shared.lock();
            if table.closed {
                return PendingCall::failed(
                    id,
                    self.shared.channel,
                    method.clone(),
                    CallError::ChannelClosed {
                        channel: self.shared.channel,
                        method,
                    },
                );
            }
            table.calls.insert(
                id,
                PendingEntry {
                    method: method.clone(),
                    completion: completion_sender,
                },
            );
        }

        trace!(target: "rpc", channel = %self.shared.channel, call = %id, %method, "post");
        if self
            .sender
            .post(Envelope::with_transfer(message.to_value(), transfer))
            .is_err()
        {
            self.shared.lock().calls.remove(&id);
            return PendingCall::failed(
                id,
                self.shared.channel,
                method.clone(),
                CallError::ChannelClosed {
                    channel: self.shared.channel,
                    method,
                },
            );
        }

        PendingCall {
            id,
            channel: self.shared.channel,
            method,
            completion: completion_receiver,
        }
    }

    fn allocate_call_id(&self) -> CallId {
        CallId(self.next_call_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!(target: "rpc", channel = %self.shared.channel, "rpc reader thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Remote")
            .field("channel", &self.shared.channel)
            .field("released", &self.is_released())
            .finish()
    }
}

/// An outstanding call. Yields its result exactly once.
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    channel: ChannelId,
    method: SmolStr,
    completion: Receiver<Completion>,
}

impl PendingCall {
    fn failed(id: CallId, channel: ChannelId, method: SmolStr, error: CallError) -> Self {
        let (sender, receiver) = bounded(1);
        let _ = sender.send(Err(error));
        Self {
            id,
            channel,
            method,
            completion: receiver,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw completion receiver, for `select!` in actor loops.
    pub fn receiver(&self) -> &Receiver<Completion> {
        &self.completion
    }

    pub fn wait(self) -> Result<Value, CallError> {
        self.completion
            .recv()
            .unwrap_or_else(|_| Err(self.closed_error()))
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<Value, CallError>> {
        match self.completion.recv_timeout(timeout) {
            Ok(completion) => Some(completion),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(self.closed_error())),
        }
    }

    pub fn try_take(&mut self) -> Option<Result<Value, CallError>> {
        match self.completion.try_recv() {
            Ok(completion) => Some(completion),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(self.closed_error())),
        }
    }

    fn closed_error(&self) -> CallError {
        CallError::ChannelClosed {
            channel: self.channel,
            method: self.method.clone(),
        }
    }
}

/// A pending call whose result decodes into `T`.
#[derive(Debug)]
pub struct TypedCall<T> {
    inner: PendingCall,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> TypedCall<T> {
    pub fn new(inner: PendingCall) -> Self {
        Self {
            inner,
            _result: PhantomData,
        }
    }

    pub fn id(&self) -> CallId {
        self.inner.id()
    }

    pub fn into_untyped(self) -> PendingCall {
        self.inner
    }

    pub fn wait(self) -> Result<T, CallError> {
        let method = self.inner.method.clone();
        let value = self.inner.wait()?;
        decode(&method, value)
    }

    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<Result<T, CallError>> {
        let completion = self.inner.wait_timeout(timeout)?;
        Some(completion.and_then(|value| decode(&self.inner.method, value)))
    }

    pub fn try_take(&mut self) -> Option<Result<T, CallError>> {
        let completion = self.inner.try_take()?;
        Some(completion.and_then(|value| decode(&self.inner.method, value)))
    }
}

fn decode<T: DeserializeOwned>(method: &SmolStr, value: Value) -> Result<T, CallError> {
    serde_json::from_value(value).map_err(|error| CallError::Decode {
        method: method.clone(),
        detail: error.to_string(),
    })
}
