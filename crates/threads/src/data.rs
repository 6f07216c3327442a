use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use resource_handler::{DeadlineQueue, Loader, ResourceHandler, RetrySchedule, StallHooks};
use rpc_bridge::{Exposed, ExposedPort, IncomingCall, Reply, RemoteError, Responder, ServeStatus, expose};
use serde_json::{Value, json};
use shims::OutboundRequest;
use tracing::{debug, info, trace};

use crate::actor::{ActorCore, ActorLoop};
use crate::{ActorRole, EventStream, methods};

const IDLE_WAIT: Duration = Duration::from_millis(50);
/// Peer channels are polled; the loop only blocks on the channel to Main.
const PEER_POLL_INTERVAL: Duration = Duration::from_millis(4);

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("read asset '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decode asset '{path}': {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Where data assets come from.
pub trait AssetSource {
    fn load(&self, path: &str) -> Result<Value, AssetError>;
}

/// JSON files under a data directory.
#[derive(Debug, Clone)]
pub struct FsAssetSource {
    root: PathBuf,
}

impl FsAssetSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetSource for FsAssetSource {
    fn load(&self, path: &str) -> Result<Value, AssetError> {
        let full_path = self.root.join(path);
        let text = std::fs::read_to_string(&full_path).map_err(|source| AssetError::Io {
            path: full_path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| AssetError::Decode {
            path: full_path,
            source,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DataSettings {
    pub data_root: PathBuf,
    pub retry_schedule: RetrySchedule,
}

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data"),
            retry_schedule: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum StallSignal {
    Halt(String),
    Resume,
}

/// Collects stall transitions until the actor forwards them to Main.
#[derive(Default)]
struct StallOutbox {
    signals: RefCell<Vec<StallSignal>>,
}

impl StallHooks for StallOutbox {
    fn halt(&self, url: &str) {
        self.signals
            .borrow_mut()
            .push(StallSignal::Halt(url.to_owned()));
    }

    fn resume(&self) {
        self.signals.borrow_mut().push(StallSignal::Resume);
    }
}

struct AssetJob {
    path: String,
    responder: Option<Responder>,
    loader: Loader,
}

type JobTable = RefCell<HashMap<u64, AssetJob>>;

/// Loads data assets with bounded retry and reports stalls to Main.
pub struct DataActor {
    core: ActorCore,
    source: Rc<dyn AssetSource>,
    timers: Rc<DeadlineQueue>,
    outbox: Rc<StallOutbox>,
    resources: ResourceHandler,
    jobs: Rc<JobTable>,
    next_job_id: u64,
    peers: Vec<ExposedPort>,
}

impl DataActor {
    pub fn new(settings: DataSettings) -> Self {
        Self::with_source(
            settings.retry_schedule,
            Box::new(FsAssetSource::new(settings.data_root)),
        )
    }

    pub fn with_source(retry_schedule: RetrySchedule, source: Box<dyn AssetSource>) -> Self {
        let timers = Rc::new(DeadlineQueue::new());
        let outbox = Rc::new(StallOutbox::default());
        let resources = ResourceHandler::with_schedule(timers.clone(), outbox.clone(), retry_schedule);
        Self {
            core: ActorCore::dropping(ActorRole::Data),
            source: Rc::from(source),
            timers,
            outbox,
            resources,
            jobs: Rc::new(RefCell::new(HashMap::new())),
            next_job_id: 1,
            peers: Vec::new(),
        }
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.borrow().len()
    }

    fn load_asset(&mut self, call: &mut IncomingCall) -> Reply {
        if let Err(error) = self.core.ensure_alive() {
            return Reply::Throw(error);
        }
        let path: String = match call.arg(0) {
            Ok(path) => path,
            Err(error) => return Reply::Throw(error),
        };
        let responder = match call.defer() {
            Ok(responder) => responder,
            Err(error) => return Reply::Throw(error),
        };

        let job_id = self.next_job_id;
        self.next_job_id = self
            .next_job_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("asset job id overflow"));

        let retry_jobs = Rc::downgrade(&self.jobs);
        let retry_source = self.source.clone();
        let loader = self.resources.create_loader(
            &path,
            move || attempt_load(&retry_jobs, retry_source.as_ref(), job_id),
            None,
            None,
        );
        debug!(target: "actor.data", job = job_id, %path, "loading asset");
        self.jobs.borrow_mut().insert(
            job_id,
            AssetJob {
                path,
                responder: Some(responder),
                loader,
            },
        );
        attempt_load(&Rc::downgrade(&self.jobs), self.source.as_ref(), job_id);
        Reply::Deferred
    }

    fn accept_peer(&mut self, call: &mut IncomingCall) -> Result<(), RemoteError> {
        self.core.ensure_alive()?;
        let handle = call.take_proxy(0)?;
        info!(target: "actor.data", channel = %handle.channel_id(), "serving peer");
        self.peers.push(expose(handle.into_port()));
        Ok(())
    }

    fn retry_loading(&mut self) -> Result<usize, RemoteError> {
        self.core.ensure_alive()?;
        let reloaded = self.resources.retry();
        if reloaded > 0 {
            info!(target: "actor.data", reloaded, "retrying stalled assets");
        }
        Ok(reloaded)
    }

    fn loading_stalled(&self) -> Value {
        let urls: Vec<String> = self
            .resources
            .pending_urls()
            .into_iter()
            .map(|url| url.to_string())
            .collect();
        json!({ "stalled": self.resources.exists(), "urls": urls })
    }

    fn terminate(&mut self) {
        self.core.terminate();
        self.timers.clear();
        // Unanswered loads reply NoReply as their responders drop.
        let abandoned: Vec<AssetJob> = self.jobs.borrow_mut().drain().map(|(_, job)| job).collect();
        if !abandoned.is_empty() {
            debug!(target: "actor.data", count = abandoned.len(), "abandoning asset loads");
        }
        drop(abandoned);
    }

    /// Forward stall transitions to Main through the linked window. Without
    /// a window link they stay queued, in order, until one is installed.
    fn flush_stall_signals(&mut self) {
        loop {
            let Some(signal) = self.outbox.signals.borrow().first().cloned() else {
                return;
            };
            let request = match &signal {
                StallSignal::Halt(url) => OutboundRequest::loading_error(url),
                StallSignal::Resume => OutboundRequest::loading_recovered(),
            };
            match self.core.shims().window.request(&request) {
                Ok(call) => {
                    self.outbox.signals.borrow_mut().remove(0);
                    self.core.track_outbound(call);
                }
                Err(error) => {
                    trace!(target: "actor.data", kind = %request.kind, %error, "loading state held");
                    return;
                }
            }
        }
    }

    fn held_stall_signals(&self) -> usize {
        self.outbox.signals.borrow().len()
    }

    fn status_detail(&self) -> Value {
        json!({
            "pendingJobs": self.pending_jobs(),
            "timers": self.timers.len(),
            "peers": self.peers.len(),
            "heldSignals": self.held_stall_signals(),
            "loading": self.loading_stalled(),
        })
    }
}

/// One load attempt for a job. A failure hands control to the job's loader,
/// which either schedules another attempt or resigns.
fn attempt_load(jobs: &Weak<JobTable>, source: &dyn AssetSource, job_id: u64) {
    let Some(jobs) = jobs.upgrade() else {
        return;
    };
    let Some(path) = jobs.borrow().get(&job_id).map(|job| job.path.clone()) else {
        return;
    };
    match source.load(&path) {
        Ok(value) => {
            let job = jobs.borrow_mut().remove(&job_id);
            if let Some(mut job) = job {
                debug!(target: "actor.data", job = job_id, %path, "asset loaded");
                if let Some(responder) = job.responder.take() {
                    responder.resolve(value);
                }
            }
        }
        Err(error) => {
            debug!(target: "actor.data", job = job_id, %error, "asset load failed");
            let loader = jobs
                .borrow()
                .get(&job_id)
                .map(|job| job.loader.clone());
            if let Some(loader) = loader {
                loader.invoke();
            }
        }
    }
}

impl Exposed for DataActor {
    fn dispatch(&mut self, call: &mut IncomingCall) -> Reply {
        let reply = match call.method() {
            methods::LINK => Reply::from_result(self.core.link(call)),
            methods::START => Reply::from_result(self.core.start().map(|_| ())),
            methods::WINDOW_EVENT_FIRED => {
                self.core.event_fired(EventStream::Window, call);
                Reply::unit()
            }
            methods::DOCUMENT_EVENT_FIRED => {
                self.core.event_fired(EventStream::Document, call);
                Reply::unit()
            }
            methods::LOAD_ASSET => self.load_asset(call),
            methods::RETRY_LOADING => Reply::from_result(self.retry_loading()),
            methods::LOADING_STALLED => Reply::Return(self.loading_stalled()),
            methods::ACCEPT_PEER => Reply::from_result(self.accept_peer(call)),
            methods::STATUS => Reply::from_result(Ok(self.core.status(self.status_detail()))),
            methods::TERMINATE => {
                self.terminate();
                Reply::unit()
            }
            other => Reply::Throw(RemoteError::unknown_method(other)),
        };
        self.flush_stall_signals();
        reply
    }
}

impl ActorLoop for DataActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn tick(&mut self, _now: Instant) -> Duration {
        self.timers.fire_due();
        self.flush_stall_signals();
        self.core.reap_outbound();
        let wait = self.timers.time_until_next().unwrap_or(IDLE_WAIT);
        if self.peers.is_empty() {
            wait
        } else {
            wait.min(PEER_POLL_INTERVAL)
        }
    }

    fn serve_peers(&mut self, budget: usize) -> usize {
        let mut peers = std::mem::take(&mut self.peers);
        let mut served = 0;
        peers.retain_mut(|peer| {
            let status = peer.try_serve(&mut PeerAccess { actor: &mut *self }, budget);
            match status {
                ServeStatus::Open { served: count } => {
                    served += count;
                    true
                }
                ServeStatus::Released | ServeStatus::Disconnected => {
                    debug!(target: "actor.data", channel = %peer.channel_id(), ?status, "peer channel closed");
                    false
                }
            }
        });
        // Peers accepted meanwhile come after the existing ones.
        peers.append(&mut self.peers);
        self.peers = peers;
        served
    }
}

/// Data as another worker sees it: asset loads and stall queries only.
/// Lifecycle calls stay with Main.
struct PeerAccess<'a> {
    actor: &'a mut DataActor,
}

impl Exposed for PeerAccess<'_> {
    fn dispatch(&mut self, call: &mut IncomingCall) -> Reply {
        match call.method() {
            methods::LOAD_ASSET | methods::LOADING_STALLED | methods::STATUS => {
                self.actor.dispatch(call)
            }
            other => Reply::Throw(RemoteError::invalid_state(format!(
                "'{other}' is only served to main"
            ))),
        }
    }
}
