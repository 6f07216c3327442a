use std::time::{Duration, Instant};

use event_trace::TraceRecorder;
use message_channel::message_channel;
use plugin_manager::PluginRecord;
use rpc_bridge::{
    CallError, Exposed, ExposedPort, IncomingCall, PendingCall, ProxyHandle, Reply, RemoteError,
    ServeStatus, TypedCall, expose_new,
};
use serde::de::DeserializeOwned;
use shims::{DocumentShim, EventRecord, HostWindow, LinkName, OutboundRequest, REQUEST_METHOD, WindowShim};
use tracing::{debug, error, info, warn};

use crate::actor::{ActorThread, spawn_actor};
use crate::client::{ActorClient, DataClient, RenderClient};
use crate::data::DataActor;
use crate::render::RenderActor;
use crate::throttle::{DEFAULT_THROTTLE_INTERVAL, DEFAULT_THROTTLED_EVENTS, EventThrottle};
use crate::{ActorError, ActorRole, EventStream, methods};

const HOST_REQUEST_BUDGET: usize = 64;

/// Input that dismisses the loading error and retries stalled resources.
const RETRY_TRIGGER_EVENTS: [&str; 3] = ["mousedown", "touchstart", "keydown"];

#[derive(Debug, Clone)]
pub struct MainSettings {
    pub throttle_interval: Duration,
    pub throttled_events: Vec<String>,
    pub plugins: Vec<PluginRecord>,
    /// Bound on each boot step (link, data push, start).
    pub boot_timeout: Duration,
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            throttle_interval: DEFAULT_THROTTLE_INTERVAL,
            throttled_events: DEFAULT_THROTTLED_EVENTS.iter().map(|kind| (*kind).to_owned()).collect(),
            plugins: Vec::new(),
            boot_timeout: Duration::from_secs(5),
        }
    }
}

/// What one [`MainContext::pump`] did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub served_requests: usize,
    pub forwarded_events: usize,
    pub completed_calls: usize,
    pub failed_calls: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum HostEffect {
    HaltRender(String),
    ResumeRender,
}

/// Serves the `window`/`document` objects Main exposes to the workers.
struct HostInbox {
    window: WindowShim,
    origin: Option<(ActorRole, LinkName)>,
    close_requested: bool,
    stalled_url: Option<String>,
    effects: Vec<HostEffect>,
}

impl HostInbox {
    fn request(&mut self, request: OutboundRequest) -> Result<(), RemoteError> {
        let (role, link) = self
            .origin
            .ok_or_else(|| RemoteError::invalid_state("request outside a host port"))?;
        debug!(target: "actor.main", %role, %link, kind = %request.kind, "worker request");
        match request.kind.as_str() {
            OutboundRequest::CLOSE if link == LinkName::Window => {
                self.window
                    .close()
                    .map_err(|error| RemoteError::invalid_state(error.to_string()))?;
                self.close_requested = true;
            }
            OutboundRequest::LOADING_ERROR => {
                let url = request.url().unwrap_or_default().to_owned();
                if self.stalled_url.is_none() {
                    info!(target: "actor.main", %url, "loading stalled");
                    self.effects.push(HostEffect::HaltRender(url.clone()));
                }
                self.stalled_url = Some(url);
            }
            OutboundRequest::LOADING_RECOVERED => {
                if self.stalled_url.take().is_some() {
                    info!(target: "actor.main", "loading recovered");
                    self.effects.push(HostEffect::ResumeRender);
                }
            }
            other => {
                return Err(RemoteError::bad_argument(
                    0,
                    format!("'{other}' is not a {link} request"),
                ));
            }
        }
        Ok(())
    }
}

impl Exposed for HostInbox {
    fn dispatch(&mut self, call: &mut IncomingCall) -> Reply {
        match call.method() {
            REQUEST_METHOD => match call.arg::<OutboundRequest>(0) {
                Ok(request) => Reply::from_result(self.request(request)),
                Err(error) => Reply::Throw(error),
            },
            methods::GET_WINDOW_DATA => Reply::from_result(Ok(self.window.refresh_from_host().clone())),
            other => Reply::Throw(RemoteError::unknown_method(other)),
        }
    }
}

struct HostPort {
    role: ActorRole,
    link: LinkName,
    port: ExposedPort,
}

struct InFlight {
    role: ActorRole,
    call: PendingCall,
}

/// The main context: owns the real window, boots the workers and forwards
/// host events to them.
pub struct MainContext {
    inbox: HostInbox,
    document: DocumentShim,
    render: RenderClient,
    data: DataClient,
    threads: Vec<ActorThread>,
    host_ports: Vec<HostPort>,
    throttle: EventThrottle,
    in_flight: Vec<InFlight>,
    recorder: Option<TraceRecorder>,
    retry_requested: bool,
}

impl MainContext {
    /// Spawn both workers, link them to this context's window and document,
    /// connect Render to Data, push the initial data to Render, then start
    /// Data and Render.
    pub fn boot<R, D>(
        host: Box<dyn HostWindow>,
        settings: MainSettings,
        render_factory: R,
        data_factory: D,
    ) -> Result<Self, ActorError>
    where
        R: FnOnce() -> RenderActor + Send + 'static,
        D: FnOnce() -> DataActor + Send + 'static,
    {
        let (render_remote, render_thread) = spawn_actor(ActorRole::Render, render_factory)?;
        let (data_remote, data_thread) = spawn_actor(ActorRole::Data, data_factory)?;
        let mut context = Self {
            inbox: HostInbox {
                window: WindowShim::host(host),
                origin: None,
                close_requested: false,
                stalled_url: None,
                effects: Vec::new(),
            },
            document: DocumentShim::new(),
            render: RenderClient::new(render_remote),
            data: DataClient::new(data_remote),
            threads: vec![render_thread, data_thread],
            host_ports: Vec::new(),
            throttle: EventThrottle::new(settings.throttle_interval, settings.throttled_events),
            in_flight: Vec::new(),
            recorder: None,
            retry_requested: false,
        };

        let timeout = settings.boot_timeout;
        for link in [LinkName::Window, LinkName::Document] {
            for client in [&*context.render, &*context.data] {
                let (port, handle) = expose_new();
                await_call(client.role(), methods::LINK, client.link(link, handle), timeout)?;
                context.host_ports.push(HostPort {
                    role: client.role(),
                    link,
                    port,
                });
            }
        }

        let (data_end, render_end) = message_channel();
        await_call(
            ActorRole::Data,
            methods::ACCEPT_PEER,
            context.data.accept_peer(ProxyHandle::from_port(data_end)),
            timeout,
        )?;
        await_call(
            ActorRole::Render,
            methods::CONNECT_DATA,
            context.render.connect_data(ProxyHandle::from_port(render_end)),
            timeout,
        )?;

        let window_data = context.inbox.window.refresh_from_host().clone();
        await_call(
            ActorRole::Render,
            methods::UPDATE_DATA,
            context.render.update_window_data(&window_data),
            timeout,
        )?;
        await_call(
            ActorRole::Render,
            methods::UPDATE_DATA,
            context.render.update_plugins(&settings.plugins),
            timeout,
        )?;

        await_call(ActorRole::Data, methods::START, context.data.start(), timeout)?;
        await_call(ActorRole::Render, methods::START, context.render.start(), timeout)?;
        info!(target: "actor.main", plugins = settings.plugins.len(), "workers started");
        Ok(context)
    }

    pub fn render(&self) -> &RenderClient {
        &self.render
    }

    pub fn data(&self) -> &DataClient {
        &self.data
    }

    pub fn window(&self) -> &WindowShim {
        &self.inbox.window
    }

    pub fn window_mut(&mut self) -> &mut WindowShim {
        &mut self.inbox.window
    }

    pub fn document_mut(&mut self) -> &mut DocumentShim {
        &mut self.document
    }

    pub fn is_close_requested(&self) -> bool {
        self.inbox.close_requested
    }

    pub fn stalled_url(&self) -> Option<&str> {
        self.inbox.stalled_url.as_deref()
    }

    pub fn calls_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Whether any worker thread has ended. [`MainContext::shutdown`]
    /// reports why.
    pub fn worker_exited(&self) -> bool {
        self.threads.iter().any(ActorThread::is_finished)
    }

    pub fn next_throttle_due(&self) -> Option<Instant> {
        self.throttle.next_due()
    }

    pub fn set_recorder(&mut self, recorder: TraceRecorder) {
        self.recorder = Some(recorder);
    }

    pub fn take_recorder(&mut self) -> Option<TraceRecorder> {
        self.recorder.take()
    }

    /// One event observed on the host. Main's own listeners see it first;
    /// the workers get it unless it is throttled. Returns whether it was
    /// forwarded now.
    pub fn host_event(&mut self, stream: EventStream, record: EventRecord, now: Instant) -> bool {
        if let Some(recorder) = self.recorder.as_mut() {
            if let Err(error) = recorder.record(stream.into(), &record) {
                warn!(target: "actor.main", %error, "recording event failed, recorder disabled");
                self.recorder = None;
            }
        }

        match stream {
            EventStream::Window => self.inbox.window.trigger_event(&record),
            EventStream::Document => self.document.trigger_event(&record),
        };

        if self.inbox.stalled_url.is_some()
            && !self.retry_requested
            && RETRY_TRIGGER_EVENTS.contains(&record.kind.as_str())
        {
            self.retry_loading();
        }

        match self.throttle.offer(stream, record, now) {
            Some(record) => {
                self.forward(stream, &record);
                true
            }
            None => false,
        }
    }

    /// Ask Data to reload every stalled resource.
    pub fn retry_loading(&mut self) {
        debug!(target: "actor.main", url = ?self.inbox.stalled_url, "retry loading");
        self.retry_requested = true;
        let call = self.data.retry_loading().into_untyped();
        self.track(ActorRole::Data, call);
    }

    fn forward(&mut self, stream: EventStream, record: &EventRecord) {
        let calls = [
            (ActorRole::Render, event_call(&self.render, stream, record)),
            (ActorRole::Data, event_call(&self.data, stream, record)),
        ];
        for (role, call) in calls {
            self.track(role, call);
        }
    }

    fn track(&mut self, role: ActorRole, call: PendingCall) {
        self.in_flight.push(InFlight { role, call });
    }

    /// Serve worker requests, apply their effects, release trailing
    /// throttled events and collect finished calls.
    pub fn pump(&mut self, now: Instant) -> PumpReport {
        let mut report = PumpReport::default();

        let inbox = &mut self.inbox;
        self.host_ports.retain_mut(|host| {
            inbox.origin = Some((host.role, host.link));
            let status = host.port.try_serve(&mut *inbox, HOST_REQUEST_BUDGET);
            inbox.origin = None;
            match status {
                ServeStatus::Open { served } => {
                    report.served_requests += served;
                    true
                }
                ServeStatus::Released | ServeStatus::Disconnected => {
                    debug!(target: "actor.main", role = %host.role, link = %host.link, ?status, "host port closed");
                    false
                }
            }
        });

        for effect in std::mem::take(&mut self.inbox.effects) {
            let call = match effect {
                HostEffect::HaltRender(url) => self.render.halt_engine(&url).into_untyped(),
                HostEffect::ResumeRender => {
                    self.retry_requested = false;
                    self.render.resume_engine().into_untyped()
                }
            };
            self.track(ActorRole::Render, call);
        }

        for (stream, record) in self.throttle.flush_due(now) {
            self.forward(stream, &record);
            report.forwarded_events += 1;
        }

        self.in_flight.retain_mut(|flight| match flight.call.try_take() {
            None => true,
            Some(Ok(_)) => {
                report.completed_calls += 1;
                false
            }
            Some(Err(error)) => {
                report.failed_calls += 1;
                log_call_failure(flight.role, flight.call.method(), &error);
                false
            }
        });
        report
    }

    /// Terminate both workers and join their threads. The first worker
    /// failure, such as a plugin that failed to load, is returned.
    pub fn shutdown(mut self, timeout: Duration) -> Result<(), ActorError> {
        info!(target: "actor.main", "shutting down");
        let mut terminations = [
            (ActorRole::Render, self.render.terminate()),
            (ActorRole::Data, self.data.terminate()),
        ];
        for (role, call) in &mut terminations {
            match call.wait_timeout(timeout) {
                None => warn!(target: "actor.main", %role, "terminate timed out"),
                Some(Err(CallError::ChannelClosed { .. })) => {
                    debug!(target: "actor.main", %role, "worker already gone")
                }
                Some(Err(error)) => warn!(target: "actor.main", %role, %error, "terminate failed"),
                Some(Ok(())) => {}
            }
        }
        drop(terminations);
        self.in_flight.clear();
        self.host_ports.clear();
        if let Some(mut recorder) = self.recorder.take() {
            if let Err(error) = recorder.flush() {
                warn!(target: "actor.main", %error, "flush event trace failed");
            }
        }

        let Self {
            render,
            data,
            threads,
            ..
        } = self;
        drop(render);
        drop(data);
        let mut result = Ok(());
        for thread in threads {
            if let Err(error) = thread.join() {
                error!(target: "actor.main", %error, "worker failed");
                result = result.and(Err(error));
            }
        }
        result
    }
}

fn event_call(client: &ActorClient, stream: EventStream, record: &EventRecord) -> PendingCall {
    match stream {
        EventStream::Window => client.window_event_fired(record),
        EventStream::Document => client.document_event_fired(record),
    }
}

fn log_call_failure(role: ActorRole, method: &str, error: &CallError) {
    match error {
        CallError::ChannelClosed { .. } => {
            debug!(target: "actor.main", %role, method, %error, "call dropped, worker gone")
        }
        _ => warn!(target: "actor.main", %role, method, %error, "call failed"),
    }
}

fn await_call<T: DeserializeOwned>(
    role: ActorRole,
    method: &'static str,
    mut call: TypedCall<T>,
    timeout: Duration,
) -> Result<T, ActorError> {
    match call.wait_timeout(timeout) {
        Some(result) => result.map_err(|source| ActorError::Call {
            role,
            method,
            source,
        }),
        None => Err(ActorError::Timeout {
            role,
            method,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}
