mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use event_trace::{TraceRecorder, TraceReplay};
use plugin_manager::{FsScriptLoader, PluginRecord, load_plugin_list};
use shims::{HostWindow, WindowData};
use threads::{DataActor, MainContext, PreloadEngine, RenderActor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::RuntimeConfig;

const PUMP_INTERVAL: Duration = Duration::from_millis(4);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(author, version, about = "Run the split-thread game runtime headless")]
struct Arguments {
    /// Runtime configuration (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c', value_parser)]
    config: Option<PathBuf>,
    /// Host event trace (JSONL) to replay into the main context.
    #[arg(long, value_parser)]
    trace: Option<PathBuf>,
    /// Record host events to this JSONL trace.
    #[arg(long, value_parser)]
    record: Option<PathBuf>,
    /// Stop after this many milliseconds. Without it the run ends when the
    /// replayed trace is exhausted or a worker asks to close the window.
    #[arg(long)]
    run_for_ms: Option<u64>,
}

/// A window with fixed properties; closing it ends the run.
struct HeadlessWindow {
    data: WindowData,
    closed: Arc<AtomicBool>,
}

impl HostWindow for HeadlessWindow {
    fn window_data(&self) -> WindowData {
        self.data.clone()
    }

    fn close(&mut self) {
        info!(target: "actor.main", "headless window closed");
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn main() -> Result<()> {
    let arguments = Arguments::parse();
    let config = match &arguments.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    let subscriber_result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter)),
        )
        .try_init();
    if subscriber_result.is_err() {
        eprintln!("tracing subscriber already installed");
    }

    let plugins = read_plugins(&config)?;
    let mut replay = arguments
        .trace
        .as_deref()
        .map(TraceReplay::from_path)
        .transpose()
        .context("open input trace")?;

    let closed = Arc::new(AtomicBool::new(false));
    let render_settings = config.render_settings();
    let data_settings = config.data_settings();
    let game_root = config.game_root.clone();
    let preload_assets = config.preload_assets.clone();
    let mut context = MainContext::boot(
        Box::new(HeadlessWindow {
            data: WindowData::default(),
            closed: closed.clone(),
        }),
        config.main_settings(plugins),
        move || {
            RenderActor::new(
                render_settings,
                Box::new(FsScriptLoader::new(game_root)),
                Box::new(PreloadEngine::new(preload_assets)),
            )
        },
        move || DataActor::new(data_settings),
    )
    .context("boot runtime")?;

    if let Some(path) = &arguments.record {
        let recorder = TraceRecorder::from_path(path).context("open record trace")?;
        context.set_recorder(recorder);
        info!(target: "actor.main", path = %path.display(), "recording host events");
    }

    let started = Instant::now();
    let run_for = arguments.run_for_ms.map(Duration::from_millis);
    let mut last_tick = started;
    loop {
        let now = Instant::now();
        if let Some(replay) = replay.as_mut() {
            let delta_micros = u64::try_from(now.saturating_duration_since(last_tick).as_micros())
                .unwrap_or(u64::MAX);
            for event in replay.advance_and_take_ready_events(delta_micros) {
                context.host_event(event.stream.into(), event.record, now);
            }
            if replay.take_completion_notice() {
                info!(target: "actor.main", events = replay.event_count(), "trace replay finished");
            }
        }
        last_tick = now;

        context.pump(now);

        if closed.load(Ordering::SeqCst) || context.is_close_requested() {
            info!(target: "actor.main", "close requested");
            break;
        }
        if context.worker_exited() {
            warn!(target: "actor.main", "a worker exited");
            break;
        }
        match run_for {
            Some(limit) if started.elapsed() >= limit => break,
            Some(_) => {}
            None => {
                if replay.as_ref().is_some_and(|replay| !replay.has_pending_events())
                    && context.next_throttle_due().is_none()
                {
                    break;
                }
            }
        }
        std::thread::sleep(PUMP_INTERVAL);
    }

    info!(target: "actor.main", elapsed_ms = started.elapsed().as_millis() as u64, "stopping");
    context
        .shutdown(SHUTDOWN_TIMEOUT)
        .context("runtime stopped")?;
    Ok(())
}

fn read_plugins(config: &RuntimeConfig) -> Result<Vec<PluginRecord>> {
    let path = config.plugins_path();
    if !path.exists() {
        warn!(target: "plugin", path = %path.display(), "no plugin list, starting without plugins");
        return Ok(Vec::new());
    }
    let plugins = load_plugin_list(&path)
        .with_context(|| format!("read plugin list {}", path.display()))?;
    info!(target: "plugin", count = plugins.len(), "plugin list loaded");
    Ok(plugins)
}
