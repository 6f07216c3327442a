use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use message_channel::{Port, message_channel};
use rpc_bridge::{
    Exposed, ExposedPort, IncomingCall, PendingCall, ProxyHandle, Remote, RemoteError,
    ServeStatus, expose, wrap,
};
use serde_json::Value;
use shims::{DocumentShim, EventRecord, LinkName, WindowShim};
use tracing::{debug, info, trace, warn};

use crate::{ActorError, ActorRole, ActorState, ActorStatus, EventStream};

const COMMAND_BUDGET: usize = 64;
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

/// A worker's `window` and `document`.
pub struct Shims {
    pub window: WindowShim,
    pub document: DocumentShim,
}

impl Shims {
    pub fn replica() -> Self {
        Self {
            window: WindowShim::replica(),
            document: DocumentShim::new(),
        }
    }

    pub fn trigger(&mut self, stream: EventStream, record: &EventRecord) -> usize {
        match stream {
            EventStream::Window => self.window.trigger_event(record),
            EventStream::Document => self.document.trigger_event(record),
        }
    }
}

/// An event that arrived before `start()`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub stream: EventStream,
    pub record: EventRecord,
}

enum PreStartPolicy {
    /// Keep the newest events; the oldest is evicted when full.
    Buffer(ArrayQueue<PendingEvent>),
    Drop,
}

/// State every worker actor shares: lifecycle, shims, pre-start events and
/// outbound requests still in flight.
pub struct ActorCore {
    role: ActorRole,
    state: ActorState,
    shims: Shims,
    pre_start: PreStartPolicy,
    delivered_events: u64,
    dropped_events: u64,
    outbound: Vec<PendingCall>,
}

impl ActorCore {
    /// Core that replays up to `capacity` early events on start.
    pub fn buffering(role: ActorRole, capacity: usize) -> Self {
        assert!(capacity > 0, "pre-start event capacity must be positive");
        Self::with_policy(role, PreStartPolicy::Buffer(ArrayQueue::new(capacity)))
    }

    /// Core that discards early events.
    pub fn dropping(role: ActorRole) -> Self {
        Self::with_policy(role, PreStartPolicy::Drop)
    }

    fn with_policy(role: ActorRole, pre_start: PreStartPolicy) -> Self {
        Self {
            role,
            state: ActorState::Created,
            shims: Shims::replica(),
            pre_start,
            delivered_events: 0,
            dropped_events: 0,
            outbound: Vec::new(),
        }
    }

    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn state(&self) -> ActorState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ActorState::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.state == ActorState::Terminated
    }

    pub fn shims(&self) -> &Shims {
        &self.shims
    }

    pub fn shims_mut(&mut self) -> &mut Shims {
        &mut self.shims
    }

    pub fn ensure_alive(&self) -> Result<(), RemoteError> {
        if self.is_terminated() {
            return Err(RemoteError::invalid_state(format!("{} is terminated", self.role)));
        }
        Ok(())
    }

    /// `link(name, proxy)`. A later link for the same name replaces the earlier one.
    pub fn link(&mut self, call: &mut IncomingCall) -> Result<(), RemoteError> {
        self.ensure_alive()?;
        let name: String = call.arg(0)?;
        let name: LinkName = name
            .parse()
            .map_err(|error| RemoteError::bad_argument(0, error))?;
        let handle = call.take_proxy(1)?;
        let replaced = match name {
            LinkName::Window => self
                .shims
                .window
                .link(handle)
                .map_err(|error| RemoteError::invalid_state(error.to_string()))?,
            LinkName::Document => self.shims.document.link(handle),
        };
        if self.state == ActorState::Created {
            self.state = ActorState::Linked;
        }
        info!(target: "actor", role = %self.role, %name, replaced, "linked");
        Ok(())
    }

    /// Enter `Running` and hand back the events buffered so far.
    pub fn start(&mut self) -> Result<Vec<PendingEvent>, RemoteError> {
        match self.state {
            ActorState::Created | ActorState::Linked => {}
            ActorState::Running => {
                return Err(RemoteError::invalid_state(format!(
                    "{} is already running",
                    self.role
                )));
            }
            ActorState::Terminated => {
                return Err(RemoteError::invalid_state(format!("{} is terminated", self.role)));
            }
        }
        self.state = ActorState::Running;
        let mut replay = Vec::new();
        if let PreStartPolicy::Buffer(queue) = &self.pre_start {
            while let Some(event) = queue.pop() {
                replay.push(event);
            }
        }
        info!(target: "actor", role = %self.role, replayed = replay.len(), dropped = self.dropped_events, "started");
        Ok(replay)
    }

    /// `windowEventFired(type, data)` / `documentEventFired(type, data)`.
    /// A missing or non-string type is ignored.
    pub fn event_fired(&mut self, stream: EventStream, call: &IncomingCall) -> usize {
        let Some(kind) = call.args().first().and_then(Value::as_str) else {
            debug!(target: "actor", role = %self.role, ?stream, "ignoring event without a type");
            return 0;
        };
        let data = call.args().get(1).cloned().unwrap_or(Value::Null);
        let record = EventRecord::from_parts(kind, data);

        match self.state {
            ActorState::Running => self.deliver(stream, &record),
            ActorState::Created | ActorState::Linked => {
                self.hold(PendingEvent { stream, record });
                0
            }
            ActorState::Terminated => {
                self.dropped_events += 1;
                0
            }
        }
    }

    pub fn deliver(&mut self, stream: EventStream, record: &EventRecord) -> usize {
        self.delivered_events += 1;
        trace!(target: "actor", role = %self.role, ?stream, kind = %record.kind, "deliver");
        self.shims.trigger(stream, record)
    }

    fn hold(&mut self, event: PendingEvent) {
        match &self.pre_start {
            PreStartPolicy::Buffer(queue) => {
                if queue.force_push(event).is_some() {
                    self.dropped_events += 1;
                }
            }
            PreStartPolicy::Drop => {
                debug!(target: "actor", role = %self.role, kind = %event.record.kind, "dropping event received before start");
                self.dropped_events += 1;
            }
        }
    }

    pub fn buffered_events(&self) -> usize {
        match &self.pre_start {
            PreStartPolicy::Buffer(queue) => queue.len(),
            PreStartPolicy::Drop => 0,
        }
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    pub fn terminate(&mut self) {
        if self.state != ActorState::Terminated {
            info!(target: "actor", role = %self.role, "terminated");
        }
        self.state = ActorState::Terminated;
    }

    pub fn status(&self, detail: Value) -> ActorStatus {
        ActorStatus {
            role: self.role,
            state: self.state,
            window_linked: self.shims.window.linked_channel().is_some(),
            document_linked: self.shims.document.linked_channel().is_some(),
            buffered_events: self.buffered_events(),
            dropped_events: self.dropped_events,
            delivered_events: self.delivered_events,
            detail,
        }
    }

    /// Keep an outbound request alive until Main answers it.
    pub fn track_outbound(&mut self, call: PendingCall) {
        self.outbound.push(call);
    }

    pub fn outbound_in_flight(&self) -> usize {
        self.outbound.len()
    }

    /// Drop answered outbound requests, logging failures.
    pub fn reap_outbound(&mut self) {
        let role = self.role;
        self.outbound.retain_mut(|call| match call.try_take() {
            None => true,
            Some(Ok(_)) => false,
            Some(Err(error)) => {
                warn!(target: "actor", %role, method = call.method(), %error, "outbound request failed");
                false
            }
        });
    }
}

/// An actor object driven by [`spawn_actor`]'s loop.
pub trait ActorLoop: Exposed {
    fn core(&self) -> &ActorCore;

    /// Periodic work between message batches. Returns how long the loop may
    /// wait for the next message before ticking again.
    fn tick(&mut self, now: Instant) -> Duration;

    /// Serve channels other than the one to Main. Returns the calls handled.
    fn serve_peers(&mut self, _budget: usize) -> usize {
        0
    }

    /// Outcome reported by [`ActorThread::join`] once the loop has ended.
    fn exit_status(&mut self) -> Result<(), ActorError> {
        Ok(())
    }
}

fn run_actor_loop<A: ActorLoop>(mut actor: A, mut port: ExposedPort) -> Result<(), ActorError> {
    let role = actor.core().role();
    loop {
        if let status @ (ServeStatus::Released | ServeStatus::Disconnected) =
            port.try_serve(&mut actor, COMMAND_BUDGET)
        {
            info!(target: "actor", %role, ?status, "channel to main closed");
            break;
        }
        actor.serve_peers(COMMAND_BUDGET);
        if actor.core().is_terminated() {
            break;
        }
        let wait = actor.tick(Instant::now()).min(MAX_IDLE_WAIT);
        if actor.core().is_terminated() {
            break;
        }
        if let status @ (ServeStatus::Released | ServeStatus::Disconnected) =
            port.serve_timeout(&mut actor, wait)
        {
            info!(target: "actor", %role, ?status, "channel to main closed");
            break;
        }
    }
    let outcome = actor.exit_status();
    // Unanswered deferred calls reply before the channel goes away.
    drop(actor);
    drop(port);
    info!(target: "actor", %role, failed = outcome.is_err(), "loop exited");
    outcome
}

/// Join handle of one worker thread.
#[derive(Debug)]
pub struct ActorThread {
    role: ActorRole,
    handle: Option<JoinHandle<Result<(), ActorError>>>,
}

impl ActorThread {
    pub fn role(&self) -> ActorRole {
        self.role
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Wait for the thread. A worker that stopped on a fatal error reports it here.
    pub fn join(mut self) -> Result<(), ActorError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(ActorError::Panicked { role: self.role }),
            },
            None => Ok(()),
        }
    }
}

/// Start an actor thread. `factory` runs on the new thread, so the actor
/// itself need not be `Send`.
pub fn spawn_actor<A, F>(role: ActorRole, factory: F) -> Result<(Remote, ActorThread), ActorError>
where
    A: ActorLoop + 'static,
    F: FnOnce() -> A + Send + 'static,
{
    let (actor_end, main_end): (Port, Port) = message_channel();
    let handle = thread::Builder::new()
        .name(format!("{role}-thread"))
        .spawn(move || {
            let actor = factory();
            run_actor_loop(actor, expose(actor_end))
        })
        .map_err(|source| ActorError::Spawn { role, source })?;
    debug!(target: "actor", %role, "thread spawned");
    Ok((
        wrap(ProxyHandle::from_port(main_end)),
        ActorThread {
            role,
            handle: Some(handle),
        },
    ))
}
