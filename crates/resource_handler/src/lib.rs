//! Bounded retry for failed resource loads, with a global pause once a
//! resource gives up.
//!
//! A [`Loader`] is the failure callback for one resource. Each invocation
//! schedules the next retry from its [`RetrySchedule`]. When the schedule is
//! used up the loader resigns: it queues a reloader and, if it is the first
//! one queued, raises the loading error and halts the run loop through
//! [`StallHooks`]. [`ResourceHandler::retry`] resumes and reloads everything
//! that resigned.
//!
//! Everything here lives on one context's thread; callbacks are not `Send`.

mod deadline;
mod reloader;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use smol_str::SmolStr;
use tracing::{debug, info, warn};

pub use deadline::DeadlineQueue;
pub use reloader::{Reloader, ReloaderQueue};

pub const DEFAULT_RETRY_MILLIS: [u64; 3] = [500, 1000, 3000];

/// Ordered waits between retries, consumed left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    waits: Vec<Duration>,
}

impl RetrySchedule {
    pub fn new(waits: Vec<Duration>) -> Self {
        Self { waits }
    }

    pub fn from_millis(millis: &[u64]) -> Self {
        Self::new(millis.iter().copied().map(Duration::from_millis).collect())
    }

    pub fn len(&self) -> usize {
        self.waits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waits.is_empty()
    }

    pub fn wait(&self, attempt: usize) -> Option<Duration> {
        self.waits.get(attempt).copied()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::from_millis(&DEFAULT_RETRY_MILLIS)
    }
}

/// Defers a callback on the owning context's loop.
pub trait TimerScheduler {
    fn schedule(&self, after: Duration, task: Box<dyn FnOnce()>);
}

/// Side effects of a loading stall on the owning context.
pub trait StallHooks {
    /// Show the loading error for `url` and stop the run loop.
    fn halt(&self, url: &str);
    /// Clear the loading error and resume the run loop.
    fn resume(&self);
}

struct HandlerState {
    reloaders: RefCell<ReloaderQueue>,
    default_schedule: RetrySchedule,
    timers: Rc<dyn TimerScheduler>,
    hooks: Rc<dyn StallHooks>,
}

/// Shared handle; clones refer to the same reloader queue.
#[derive(Clone)]
pub struct ResourceHandler {
    state: Rc<HandlerState>,
}

impl ResourceHandler {
    pub fn new(timers: Rc<dyn TimerScheduler>, hooks: Rc<dyn StallHooks>) -> Self {
        Self::with_schedule(timers, hooks, RetrySchedule::default())
    }

    pub fn with_schedule(
        timers: Rc<dyn TimerScheduler>,
        hooks: Rc<dyn StallHooks>,
        default_schedule: RetrySchedule,
    ) -> Self {
        Self {
            state: Rc::new(HandlerState {
                reloaders: RefCell::new(ReloaderQueue::new()),
                default_schedule,
                timers,
                hooks,
            }),
        }
    }

    pub fn default_schedule(&self) -> &RetrySchedule {
        &self.state.default_schedule
    }

    /// Failure callback for one resource. `schedule` falls back to the
    /// handler's default. An empty `url` never queues a reloader.
    pub fn create_loader(
        &self,
        url: &str,
        retry_method: impl Fn() + 'static,
        resign_method: Option<Box<dyn Fn()>>,
        schedule: Option<RetrySchedule>,
    ) -> Loader {
        Loader {
            url: SmolStr::new(url),
            retry_method: Rc::new(retry_method),
            resign_method: resign_method.map(Rc::from),
            schedule: schedule.unwrap_or_else(|| self.state.default_schedule.clone()),
            retry_count: Rc::new(Cell::new(0)),
            state: self.state.clone(),
        }
    }

    /// Whether any resource has given up and waits for [`ResourceHandler::retry`].
    pub fn exists(&self) -> bool {
        !self.state.reloaders.borrow().is_empty()
    }

    pub fn pending_urls(&self) -> Vec<SmolStr> {
        self.state.reloaders.borrow().urls()
    }

    /// Resume and run every queued reloader once. Returns how many ran.
    pub fn retry(&self) -> usize {
        let reloaders = self.state.reloaders.borrow_mut().take_all();
        if reloaders.is_empty() {
            return 0;
        }
        info!(target: "resource", count = reloaders.len(), "retrying resigned resources");
        self.state.hooks.resume();
        let count = reloaders.len();
        // A reloader may fail again synchronously and queue itself anew.
        for reloader in reloaders {
            reloader.run();
        }
        count
    }
}

/// Failure callback for one resource.
#[derive(Clone)]
pub struct Loader {
    url: SmolStr,
    retry_method: Rc<dyn Fn()>,
    resign_method: Option<Rc<dyn Fn()>>,
    schedule: RetrySchedule,
    retry_count: Rc<Cell<usize>>,
    state: Rc<HandlerState>,
}

impl Loader {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn retry_count(&self) -> usize {
        self.retry_count.get()
    }

    /// Report one failure.
    pub fn invoke(&self) {
        let attempt = self.retry_count.get();
        if let Some(wait) = self.schedule.wait(attempt) {
            debug!(target: "resource", url = %self.url, attempt, wait_ms = wait.as_millis() as u64, "scheduling retry");
            let retry_method = self.retry_method.clone();
            self.state
                .timers
                .schedule(wait, Box::new(move || retry_method()));
            self.retry_count.set(attempt + 1);
            return;
        }

        warn!(target: "resource", url = %self.url, attempts = attempt, "resource resigned");
        if let Some(resign_method) = &self.resign_method {
            resign_method();
        }
        if self.url.is_empty() {
            return;
        }

        let retry_count = self.retry_count.clone();
        let retry_method = self.retry_method.clone();
        let first_stall = {
            let mut reloaders = self.state.reloaders.borrow_mut();
            let first_stall = reloaders.is_empty();
            reloaders.push(Reloader::new(
                self.url.clone(),
                Box::new(move || {
                    retry_count.set(0);
                    retry_method();
                }),
            ));
            first_stall
        };
        if first_stall {
            info!(target: "resource", url = %self.url, "loading stalled");
            self.state.hooks.halt(&self.url);
        }
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Loader")
            .field("url", &self.url)
            .field("retry_count", &self.retry_count.get())
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}
