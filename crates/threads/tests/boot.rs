use std::cell::Cell;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use plugin_manager::{FsScriptLoader, LoadErrorReporter, PluginRecord, ScriptLoader};
use resource_handler::RetrySchedule;
use serde_json::{Value, json};
use shims::{EventRecord, HostWindow, WindowData};
use threads::{
    ActorError, ActorRole, ActorState, AssetError, AssetSource, DataActor, Engine, EngineContext,
    EventStream, MainContext, MainSettings, PreloadEngine, RenderActor, RenderSettings,
};

struct FakeHost {
    closed: Arc<AtomicBool>,
}

impl HostWindow for FakeHost {
    fn window_data(&self) -> WindowData {
        WindowData {
            inner_width: 1024,
            inner_height: 768,
            ..WindowData::default()
        }
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Asks the host to close on the first update after Escape.
#[derive(Default)]
struct CloseOnEscape {
    pressed: Rc<Cell<bool>>,
    requested: bool,
}

impl Engine for CloseOnEscape {
    fn boot(&mut self, context: &mut EngineContext<'_>) {
        let pressed = self.pressed.clone();
        context
            .core
            .shims_mut()
            .document
            .add_event_listener("keydown", move |record: &EventRecord| {
                if record.get("key") == Some(&json!("Escape")) {
                    pressed.set(true);
                }
            });
    }

    fn update(&mut self, context: &mut EngineContext<'_>) {
        if !self.pressed.get() || self.requested {
            return;
        }
        self.requested = true;
        match context.core.shims_mut().window.close() {
            Ok(Some(call)) => context.core.track_outbound(call),
            Ok(None) => {}
            Err(error) => panic!("request close: {error}"),
        }
    }
}

struct NullLoader;

impl ScriptLoader for NullLoader {
    fn load_script(&mut self, _url: &str, _errors: &LoadErrorReporter) {}
}

struct FlakySource {
    attempts: Arc<AtomicUsize>,
    failures: usize,
}

impl AssetSource for FlakySource {
    fn load(&self, path: &str) -> Result<Value, AssetError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(AssetError::Io {
                path: PathBuf::from(path),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "server busy"),
            });
        }
        Ok(json!({ "events": [] }))
    }
}

struct Harness {
    context: MainContext,
    closed: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Boots Main with both workers; `plugin_root` switches from a no-op loader to reading
/// scripts from disk.
fn boot(
    failures: usize,
    plugin_root: Option<PathBuf>,
    engine: impl FnOnce() -> Box<dyn Engine> + Send + 'static,
) -> Harness {
    let closed = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    let source_attempts = attempts.clone();
    let settings = MainSettings {
        plugins: vec![PluginRecord::new("Community_Basic", true)],
        ..MainSettings::default()
    };
    let context = MainContext::boot(
        Box::new(FakeHost {
            closed: closed.clone(),
        }),
        settings,
        move || {
            let loader: Box<dyn ScriptLoader> = match plugin_root {
                Some(root) => Box::new(FsScriptLoader::new(root)),
                None => Box::new(NullLoader),
            };
            RenderActor::new(RenderSettings::default(), loader, engine())
        },
        move || {
            DataActor::with_source(
                RetrySchedule::from_millis(&[5]),
                Box::new(FlakySource {
                    attempts: source_attempts,
                    failures,
                }),
            )
        },
    )
    .unwrap_or_else(|error| panic!("boot main context: {error}"));
    Harness {
        context,
        closed,
        attempts,
    }
}

fn boot_closing_on_escape(failures: usize) -> Harness {
    boot(failures, None, || Box::new(CloseOnEscape::default()))
}

fn render_detail(context: &MainContext) -> Option<Value> {
    Some(context.render().status().wait().ok()?.detail)
}

fn pump_until<T>(context: &mut MainContext, mut done: impl FnMut(&mut MainContext) -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        context.pump(Instant::now());
        if let Some(value) = done(&mut *context) {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn boot_links_and_starts_both_workers() {
    let Harness { context, .. } = boot_closing_on_escape(0);

    let render = context
        .render()
        .status()
        .wait()
        .unwrap_or_else(|error| panic!("render status: {error}"));
    assert_eq!(render.state, ActorState::Running);
    assert!(render.window_linked && render.document_linked);
    assert_eq!(render.detail["window"]["innerWidth"], json!(1024));
    assert_eq!(render.detail["loadedPlugins"], json!(["Community_Basic"]));

    let data = context
        .data()
        .status()
        .wait()
        .unwrap_or_else(|error| panic!("data status: {error}"));
    assert_eq!(data.state, ActorState::Running);
    assert!(data.window_linked && data.document_linked);

    context
        .shutdown(Duration::from_secs(2))
        .unwrap_or_else(|error| panic!("shutdown: {error}"));
}

#[test]
fn escape_in_render_closes_the_host_window() {
    let Harness {
        mut context, closed, ..
    } = boot_closing_on_escape(0);
    let forwarded = context.host_event(
        EventStream::Document,
        EventRecord::new("keydown").with("key", "Escape"),
        Instant::now(),
    );
    assert!(forwarded);

    pump_until(&mut context, |context| context.is_close_requested().then_some(()));
    assert!(closed.load(Ordering::SeqCst));

    context
        .shutdown(Duration::from_secs(2))
        .unwrap_or_else(|error| panic!("shutdown: {error}"));
}

#[test]
fn stalled_asset_halts_render_until_player_input_retries() {
    let Harness {
        mut context,
        attempts,
        ..
    } = boot_closing_on_escape(2);
    let mut load = context.data().load_asset("Map001.json");

    pump_until(&mut context, |context| context.stalled_url().map(str::to_owned));
    assert_eq!(context.stalled_url(), Some("Map001.json"));
    pump_until(&mut context, |context| {
        let status = context.render().status().wait().ok()?;
        (status.detail["stalledUrl"] == json!("Map001.json")).then_some(())
    });

    context.host_event(EventStream::Document, EventRecord::new("mousedown"), Instant::now());
    let value = pump_until(&mut context, |_| load.try_take())
        .unwrap_or_else(|error| panic!("load asset: {error}"));
    assert_eq!(value, json!({ "events": [] }));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    pump_until(&mut context, |context| context.stalled_url().is_none().then_some(()));
    pump_until(&mut context, |context| {
        let status = context.render().status().wait().ok()?;
        status.detail["stalledUrl"].is_null().then_some(())
    });

    context
        .shutdown(Duration::from_secs(2))
        .unwrap_or_else(|error| panic!("shutdown: {error}"));
}

#[test]
fn throttled_moves_release_the_last_position() {
    let Harness { mut context, .. } = boot_closing_on_escape(0);
    let start = Instant::now();
    for x in 0..5 {
        context.host_event(
            EventStream::Document,
            EventRecord::new("mousemove").with("clientX", x),
            start,
        );
    }
    let due = context
        .next_throttle_due()
        .unwrap_or_else(|| panic!("a trailing mousemove should be pending"));
    let report = context.pump(due);
    assert_eq!(report.forwarded_events, 1);
    assert_eq!(context.next_throttle_due(), None);

    let data = pump_until(&mut context, |context| {
        let status = context.data().status().wait().ok()?;
        (status.delivered_events == 2).then_some(status)
    });
    assert_eq!(data.dropped_events, 0);

    context
        .shutdown(Duration::from_secs(2))
        .unwrap_or_else(|error| panic!("shutdown: {error}"));
}

#[test]
fn render_initiated_load_stalls_and_recovers_on_player_input() {
    let Harness {
        mut context,
        attempts,
        ..
    } = boot(2, None, || {
        Box::new(PreloadEngine::new(vec!["Map002.json".to_owned()]))
    });

    pump_until(&mut context, |context| context.stalled_url().map(str::to_owned));
    assert_eq!(context.stalled_url(), Some("Map002.json"));
    let halted = pump_until(&mut context, |context| {
        let detail = render_detail(context)?;
        (detail["stalledUrl"] == json!("Map002.json")).then_some(detail)
    });
    assert_eq!(halted["engine"]["pending"], json!(["Map002.json"]));

    context.host_event(EventStream::Document, EventRecord::new("mousedown"), Instant::now());
    let detail = pump_until(&mut context, |context| {
        let detail = render_detail(context)?;
        (detail["engine"]["loaded"] == json!(["Map002.json"])).then_some(detail)
    });
    assert_eq!(detail["engine"]["failed"], json!([]));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    pump_until(&mut context, |context| context.stalled_url().is_none().then_some(()));
    pump_until(&mut context, |context| {
        render_detail(context)?["stalledUrl"].is_null().then_some(())
    });

    context
        .shutdown(Duration::from_secs(2))
        .unwrap_or_else(|error| panic!("shutdown: {error}"));
}

#[test]
fn missing_plugin_script_ends_the_run_with_its_url() {
    let root = std::env::temp_dir().join(format!("threads_missing_plugin_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(root.join("js/plugins"))
        .unwrap_or_else(|error| panic!("create {}: {error}", root.display()));

    let Harness { mut context, .. } = boot(0, Some(root.clone()), || {
        Box::new(CloseOnEscape::default())
    });
    pump_until(&mut context, |context| context.worker_exited().then_some(()));

    match context.shutdown(Duration::from_secs(2)) {
        Err(ActorError::Plugin { role, source }) => {
            assert_eq!(role, ActorRole::Render);
            assert_eq!(source.to_string(), "Failed to load: js/plugins/Community_Basic.js");
        }
        other => panic!("expected a plugin failure, got {other:?}"),
    }
    let _ = std::fs::remove_dir_all(&root);
}
