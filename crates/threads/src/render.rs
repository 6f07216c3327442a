use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use frame_scheduler::{
    FrameScheduler, FrameSchedulerConfig, FrameSchedulerInput, SchedulerUpdateReason,
};
use plugin_manager::{DEFAULT_PLUGIN_PATH, PluginError, PluginManager, PluginRecord, ScriptLoader};
use rpc_bridge::{Exposed, IncomingCall, PendingCall, Reply, RemoteError, wrap};
use serde_json::{Value, json};
use shims::WindowData;
use tracing::{debug, error, info, warn};

use crate::actor::{ActorCore, ActorLoop};
use crate::client::DataClient;
use crate::{ActorError, ActorRole, EventStream, methods};

const IDLE_WAIT: Duration = Duration::from_millis(50);

/// What engine hooks reach on the render thread.
pub struct EngineContext<'a> {
    pub core: &'a mut ActorCore,
    assets: Option<&'a DataClient>,
}

impl EngineContext<'_> {
    /// Request an asset from Data. Failed loads are retried there, stalling
    /// the engine until the player retries; the call resolves once the asset
    /// arrives. `None` until Main has connected Data.
    pub fn load_asset(&self, path: &str) -> Option<PendingCall> {
        self.assets.map(|assets| assets.load_asset(path))
    }
}

/// The game engine driven by the render loop. Runs on the render thread.
pub trait Engine {
    /// Called once on `start`, after plugins were issued.
    fn boot(&mut self, _context: &mut EngineContext<'_>) {}

    /// One fixed-step update.
    fn update(&mut self, _context: &mut EngineContext<'_>) {}

    fn render(&mut self, _context: &mut EngineContext<'_>) {}

    /// Engine-specific part of Render's `status()`.
    fn status(&self) -> Value {
        Value::Null
    }
}

/// Database files a game loads before its first scene.
pub const DATABASE_FILES: [&str; 14] = [
    "Actors.json",
    "Classes.json",
    "Skills.json",
    "Items.json",
    "Weapons.json",
    "Armors.json",
    "Enemies.json",
    "Troops.json",
    "States.json",
    "Animations.json",
    "Tilesets.json",
    "CommonEvents.json",
    "System.json",
    "MapInfos.json",
];

/// Requests a fixed set of data assets on boot and keeps them as they arrive.
#[derive(Debug, Default)]
pub struct PreloadEngine {
    paths: Vec<String>,
    pending: Vec<(String, PendingCall)>,
    loaded: BTreeMap<String, Value>,
    failed: Vec<String>,
}

impl PreloadEngine {
    pub fn new(mut paths: Vec<String>) -> Self {
        let mut seen = BTreeSet::new();
        paths.retain(|path| seen.insert(path.clone()));
        Self {
            paths,
            ..Self::default()
        }
    }

    /// Every requested asset either arrived or failed.
    pub fn is_complete(&self) -> bool {
        self.loaded.len() + self.failed.len() == self.paths.len()
    }

    pub fn asset(&self, path: &str) -> Option<&Value> {
        self.loaded.get(path)
    }
}

impl Engine for PreloadEngine {
    fn boot(&mut self, context: &mut EngineContext<'_>) {
        for path in &self.paths {
            match context.load_asset(path) {
                Some(call) => self.pending.push((path.clone(), call)),
                None => warn!(target: "actor.render", %path, "no data connection, asset skipped"),
            }
        }
    }

    fn update(&mut self, _context: &mut EngineContext<'_>) {
        if self.pending.is_empty() {
            return;
        }
        let loaded = &mut self.loaded;
        let failed = &mut self.failed;
        self.pending.retain_mut(|(path, call)| match call.try_take() {
            None => true,
            Some(Ok(value)) => {
                debug!(target: "actor.render", %path, "asset arrived");
                loaded.insert(path.clone(), value);
                false
            }
            Some(Err(error)) => {
                warn!(target: "actor.render", %path, %error, "asset request failed");
                failed.push(path.clone());
                false
            }
        });
        if self.pending.is_empty() {
            info!(target: "actor.render", loaded = self.loaded.len(), failed = self.failed.len(), "preload finished");
        }
    }

    fn status(&self) -> Value {
        json!({
            "pending": self.pending.iter().map(|(path, _)| path).collect::<Vec<_>>(),
            "loaded": self.loaded.keys().collect::<Vec<_>>(),
            "failed": self.failed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub plugin_base_path: String,
    pub scheduler: FrameSchedulerConfig,
    /// Events kept from before `start`; older ones are evicted.
    pub pending_event_capacity: usize,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            plugin_base_path: DEFAULT_PLUGIN_PATH.to_owned(),
            scheduler: FrameSchedulerConfig::default(),
            pending_event_capacity: 256,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FrameCounters {
    frames: u64,
    updates: u64,
    halted_frames: u64,
}

/// Runs the engine: owns the plugin manager and the frame loop.
pub struct RenderActor {
    core: ActorCore,
    plugins: PluginManager,
    plugin_list: Vec<PluginRecord>,
    engine: Box<dyn Engine>,
    assets: Option<DataClient>,
    scheduler: FrameScheduler,
    step: Duration,
    last_frame_at: Option<Instant>,
    frame_sequence_id: u64,
    counters: FrameCounters,
    stalled_url: Option<String>,
    failure: Option<PluginError>,
}

impl RenderActor {
    pub fn new(
        settings: RenderSettings,
        script_loader: Box<dyn ScriptLoader>,
        engine: Box<dyn Engine>,
    ) -> Self {
        let scheduler = FrameScheduler::new(settings.scheduler);
        Self {
            core: ActorCore::buffering(ActorRole::Render, settings.pending_event_capacity),
            plugins: PluginManager::new(settings.plugin_base_path, script_loader),
            plugin_list: Vec::new(),
            engine,
            assets: None,
            step: Duration::from_micros(settings.scheduler.step_micros()),
            scheduler,
            last_frame_at: None,
            frame_sequence_id: 0,
            counters: FrameCounters::default(),
            stalled_url: None,
            failure: None,
        }
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    fn update_data(&mut self, call: &IncomingCall) -> Result<(), RemoteError> {
        self.core.ensure_alive()?;
        let kind: String = call.arg(0)?;
        match kind.as_str() {
            "window" => {
                let data: WindowData = call.arg(1)?;
                self.core.shims_mut().window.update_data(data);
            }
            "plugins" => {
                let list: Vec<PluginRecord> = call.arg(1)?;
                debug!(target: "actor.render", count = list.len(), "plugin list received");
                self.plugin_list = list;
            }
            other => {
                return Err(RemoteError::bad_argument(
                    0,
                    format!("unknown data kind '{other}'"),
                ));
            }
        }
        Ok(())
    }

    fn connect_data(&mut self, call: &mut IncomingCall) -> Result<(), RemoteError> {
        self.core.ensure_alive()?;
        let handle = call.take_proxy(0)?;
        info!(target: "actor.render", channel = %handle.channel_id(), "data connected");
        self.assets = Some(DataClient::new(wrap(handle)));
        Ok(())
    }

    fn start(&mut self) -> Result<(), RemoteError> {
        let replay = self.core.start()?;
        let issued = self.plugins.setup(&self.plugin_list);
        info!(target: "actor.render", plugins = issued, "plugins issued");
        self.engine.boot(&mut EngineContext {
            core: &mut self.core,
            assets: self.assets.as_ref(),
        });
        for event in &replay {
            self.core.deliver(event.stream, &event.record);
        }
        Ok(())
    }

    fn halt_engine(&mut self, call: &IncomingCall) -> Result<(), RemoteError> {
        self.core.ensure_alive()?;
        let url: String = call.arg_or_default(0)?;
        info!(target: "actor.render", %url, "engine halted");
        self.stalled_url = Some(url);
        Ok(())
    }

    fn resume_engine(&mut self) -> Result<(), RemoteError> {
        self.core.ensure_alive()?;
        if let Some(url) = self.stalled_url.take() {
            info!(target: "actor.render", %url, "engine resumed");
        }
        Ok(())
    }

    fn status_detail(&self) -> Value {
        json!({
            "frames": self.counters.frames,
            "updates": self.counters.updates,
            "haltedFrames": self.counters.halted_frames,
            "loadedPlugins": self.plugins.loaded_scripts(),
            "failure": self.failure.as_ref().map(ToString::to_string),
            "stalledUrl": self.stalled_url,
            "window": self.core.shims().window.data(),
            "engine": self.engine.status(),
        })
    }

    fn run_frame(&mut self, now: Instant) {
        let elapsed = self
            .last_frame_at
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or_default();
        self.last_frame_at = Some(now);
        self.frame_sequence_id = self
            .frame_sequence_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("frame sequence overflow"));

        let decision = self.scheduler.schedule_frame(FrameSchedulerInput {
            frame_sequence_id: self.frame_sequence_id,
            elapsed_micros: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
            run_loop_stopped: self.stalled_url.is_some(),
        });
        match decision.update_reason {
            Some(SchedulerUpdateReason::Halted) => {
                debug!(target: "actor.render", frame = decision.frame_sequence_id, "run loop stopped")
            }
            Some(SchedulerUpdateReason::Resumed) => {
                debug!(target: "actor.render", frame = decision.frame_sequence_id, "run loop resumed")
            }
            Some(SchedulerUpdateReason::CatchUpCapped) => {
                warn!(target: "actor.render", frame = decision.frame_sequence_id, "frame catch-up capped")
            }
            None => {}
        }

        let mut context = EngineContext {
            core: &mut self.core,
            assets: self.assets.as_ref(),
        };
        for _ in 0..decision.updates_to_run {
            self.engine.update(&mut context);
        }
        self.counters.updates += u64::from(decision.updates_to_run);
        if decision.render {
            self.engine.render(&mut context);
            self.counters.frames += 1;
        } else {
            self.counters.halted_frames += 1;
        }
    }
}

impl Exposed for RenderActor {
    fn dispatch(&mut self, call: &mut IncomingCall) -> Reply {
        match call.method() {
            methods::LINK => Reply::from_result(self.core.link(call)),
            methods::START => Reply::from_result(self.start()),
            methods::WINDOW_EVENT_FIRED => {
                self.core.event_fired(EventStream::Window, call);
                Reply::unit()
            }
            methods::DOCUMENT_EVENT_FIRED => {
                self.core.event_fired(EventStream::Document, call);
                Reply::unit()
            }
            methods::UPDATE_DATA => Reply::from_result(self.update_data(call)),
            methods::HALT_ENGINE => Reply::from_result(self.halt_engine(call)),
            methods::RESUME_ENGINE => Reply::from_result(self.resume_engine()),
            methods::CONNECT_DATA => Reply::from_result(self.connect_data(call)),
            methods::STATUS => Reply::from_result(Ok(self.core.status(self.status_detail()))),
            methods::TERMINATE => {
                self.core.terminate();
                Reply::unit()
            }
            other => Reply::Throw(RemoteError::unknown_method(other)),
        }
    }
}

impl ActorLoop for RenderActor {
    fn core(&self) -> &ActorCore {
        &self.core
    }

    fn tick(&mut self, now: Instant) -> Duration {
        if !self.core.is_running() {
            return IDLE_WAIT;
        }
        if let Err(failure) = self.plugins.check_errors() {
            error!(target: "actor.render", %failure, "plugin failed to load");
            self.failure = Some(failure);
            self.core.terminate();
            return Duration::ZERO;
        }

        let next_frame_at = match self.last_frame_at {
            Some(last) => last + self.step,
            None => now,
        };
        if now >= next_frame_at {
            self.run_frame(now);
        }
        self.core.reap_outbound();

        let next_frame_at = self.last_frame_at.map_or(now, |last| last + self.step);
        next_frame_at.saturating_duration_since(now)
    }

    fn exit_status(&mut self) -> Result<(), ActorError> {
        match self.failure.take() {
            Some(source) => Err(ActorError::Plugin {
                role: ActorRole::Render,
                source,
            }),
            None => Ok(()),
        }
    }
}
