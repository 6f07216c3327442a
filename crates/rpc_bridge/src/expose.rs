use std::time::Duration;

use message_channel::{
    ChannelId, Envelope, Port, PortSender, RecvTimeoutError, TryRecvError,
};
use rpc_protocol::{CallId, RemoteError, RpcMessage, transfer_index};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use smol_str::SmolStr;
use tracing::{debug, trace, warn};

use crate::ProxyHandle;

/// A local object whose methods can be invoked from another context.
pub trait Exposed {
    fn dispatch(&mut self, call: &mut IncomingCall) -> Reply;
}

/// What a method hands back to the bridge.
#[derive(Debug)]
pub enum Reply {
    Return(Value),
    Throw(RemoteError),
    /// The method took the call's [`Responder`] and will answer later.
    Deferred,
}

impl Reply {
    pub fn unit() -> Self {
        Reply::Return(Value::Null)
    }

    pub fn from_result<T: Serialize>(result: Result<T, RemoteError>) -> Self {
        match result {
            Ok(value) => match serde_json::to_value(value) {
                Ok(value) => Reply::Return(value),
                Err(error) => Reply::Throw(RemoteError::new(
                    "EncodeError",
                    format!("result is not representable: {error}"),
                )),
            },
            Err(error) => Reply::Throw(error),
        }
    }
}

/// One decoded `Apply` request.
pub struct IncomingCall {
    id: CallId,
    method: SmolStr,
    args: Vec<Value>,
    transfer: Vec<Option<Port>>,
    responder: Option<Responder>,
}

impl IncomingCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, RemoteError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| RemoteError::bad_argument(index, "missing"))?;
        serde_json::from_value(value.clone()).map_err(|error| RemoteError::bad_argument(index, error))
    }

    /// Like [`IncomingCall::arg`], but a missing or `null` argument yields the default.
    pub fn arg_or_default<T: DeserializeOwned + Default>(
        &self,
        index: usize,
    ) -> Result<T, RemoteError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.arg(index),
        }
    }

    /// Take the port transferred for argument `index`.
    pub fn take_proxy(&mut self, index: usize) -> Result<ProxyHandle, RemoteError> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| RemoteError::bad_argument(index, "missing"))?;
        let transfer_slot = transfer_index(value)
            .ok_or_else(|| RemoteError::bad_argument(index, "expected a transferred proxy"))?;
        let port = self
            .transfer
            .get_mut(transfer_slot)
            .and_then(Option::take)
            .ok_or_else(|| {
                RemoteError::bad_argument(index, format!("transfer slot {transfer_slot} is empty"))
            })?;
        Ok(ProxyHandle::from_port(port))
    }

    /// Take over the reply. The method must return [`Reply::Deferred`].
    pub fn defer(&mut self) -> Result<Responder, RemoteError> {
        self.responder
            .take()
            .ok_or_else(|| RemoteError::invalid_state("call was already deferred"))
    }
}

/// Sends the reply of one call, possibly long after the call was dispatched.
///
/// Dropping an unanswered responder replies with a `NoReply` error.
pub struct Responder {
    id: CallId,
    method: SmolStr,
    sender: PortSender,
    answered: bool,
}

impl Responder {
    pub fn call_id(&self) -> CallId {
        self.id
    }

    pub fn resolve(mut self, value: Value) {
        self.send(RpcMessage::Return { id: self.id, value });
    }

    pub fn resolve_with<T: Serialize>(self, value: T) {
        match serde_json::to_value(value) {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(RemoteError::new(
                "EncodeError",
                format!("result is not representable: {error}"),
            )),
        }
    }

    pub fn reject(mut self, error: RemoteError) {
        self.send(RpcMessage::Throw { id: self.id, error });
    }

    fn send(&mut self, message: RpcMessage) {
        self.answered = true;
        if let Err(error) = self.sender.post(Envelope::new(message.to_value())) {
            debug!(target: "rpc", call = %self.id, method = %self.method, %error, "caller went away before reply");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            let error = RemoteError::no_reply(&self.method);
            self.send(RpcMessage::Throw { id: self.id, error });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeStatus {
    Open { served: usize },
    /// The remote released its proxy; nothing more will be served.
    Released,
    Disconnected,
}

/// The serving end of a channel. Owned by the exposing context's loop.
pub struct ExposedPort {
    channel: ChannelId,
    port: Option<Port>,
    served_total: u64,
}

pub fn expose(port: Port) -> ExposedPort {
    ExposedPort {
        channel: port.channel_id(),
        port: Some(port),
        served_total: 0,
    }
}

impl ExposedPort {
    pub fn channel_id(&self) -> ChannelId {
        self.channel
    }

    pub fn is_released(&self) -> bool {
        self.port.is_none()
    }

    pub fn served_total(&self) -> u64 {
        self.served_total
    }

    /// Raw receiver for `select!`; `None` once released.
    pub fn receiver(&self) -> Option<&crossbeam_channel::Receiver<Envelope>> {
        self.port.as_ref().map(|port| port.receiver().as_receiver())
    }

    /// Serve whatever is queued, up to `budget` messages, without waiting.
    pub fn try_serve<E: Exposed + ?Sized>(&mut self, object: &mut E, budget: usize) -> ServeStatus {
        let mut served = 0;
        while served < budget {
            let Some(port) = self.port.as_ref() else {
                return ServeStatus::Released;
            };
            match port.try_recv() {
                Ok(envelope) => {
                    self.handle(envelope, object);
                    served += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return ServeStatus::Disconnected,
            }
        }
        if self.port.is_none() {
            return ServeStatus::Released;
        }
        ServeStatus::Open { served }
    }

    /// Wait up to `timeout` for one message and serve it.
    pub fn serve_timeout<E: Exposed + ?Sized>(
        &mut self,
        object: &mut E,
        timeout: Duration,
    ) -> ServeStatus {
        let Some(port) = self.port.as_ref() else {
            return ServeStatus::Released;
        };
        match port.recv_timeout(timeout) {
            Ok(envelope) => {
                self.handle(envelope, object);
                if self.port.is_none() {
                    ServeStatus::Released
                } else {
                    ServeStatus::Open { served: 1 }
                }
            }
            Err(RecvTimeoutError::Timeout) => ServeStatus::Open { served: 0 },
            Err(RecvTimeoutError::Disconnected) => ServeStatus::Disconnected,
        }
    }

    /// Serve one envelope already taken off the receiver.
    pub fn handle<E: Exposed + ?Sized>(&mut self, envelope: Envelope, object: &mut E) {
        let Some(port) = self.port.as_ref() else {
            return;
        };
        let Envelope { data, transfer } = envelope;
        let message = match RpcMessage::from_value(data) {
            Ok(message) => message,
            Err(error) => {
                warn!(target: "rpc", channel = %self.channel, %error, "dropping malformed request");
                return;
            }
        };

        match message {
            RpcMessage::Apply { id, method, args } => {
                trace!(target: "rpc", channel = %self.channel, call = %id, %method, "dispatch");
                let mut call = IncomingCall {
                    id,
                    method: method.clone(),
                    args,
                    transfer: transfer.into_iter().map(Some).collect(),
                    responder: Some(Responder {
                        id,
                        method,
                        sender: port.sender().clone(),
                        answered: false,
                    }),
                };
                let reply = object.dispatch(&mut call);
                self.served_total = self.served_total.wrapping_add(1);
                match (reply, call.responder.take()) {
                    (Reply::Return(value), Some(responder)) => responder.resolve(value),
                    (Reply::Throw(error), Some(responder)) => responder.reject(error),
                    (Reply::Deferred, Some(responder)) => {
                        warn!(target: "rpc", call = %id, method = %call.method, "deferred without taking the responder");
                        drop(responder);
                    }
                    (Reply::Deferred, None) => {}
                    (_, None) => {
                        warn!(target: "rpc", call = %id, method = %call.method, "immediate reply ignored, responder was taken");
                    }
                }
            }
            RpcMessage::Release { id } => {
                debug!(target: "rpc", channel = %self.channel, call = %id, "proxy released");
                let ack = RpcMessage::Return {
                    id,
                    value: Value::Null,
                };
                if let Err(error) = port.post(Envelope::new(ack.to_value())) {
                    debug!(target: "rpc", %error, "release ack not delivered");
                }
                self.port = None;
            }
            RpcMessage::Return { id, .. } | RpcMessage::Throw { id, .. } => {
                warn!(target: "rpc", channel = %self.channel, call = %id, "response arrived on an exposed port");
            }
        }
    }
}
