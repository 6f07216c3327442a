use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::{TraceError, TraceEvent, read_jsonl_events};

/// Feeds recorded events back on a simulated timeline advanced by the caller.
pub struct TraceReplay {
    replay_elapsed_micros: u64,
    events: Vec<TraceEvent>,
    next_event_index: usize,
    completion_reported: bool,
}

impl TraceReplay {
    pub fn from_path(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(&mut BufReader::new(file))
    }

    pub fn from_reader(reader: &mut dyn BufRead) -> Result<Self, TraceError> {
        Ok(Self::from_events(read_jsonl_events(reader)?))
    }

    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        Self {
            replay_elapsed_micros: 0,
            events,
            next_event_index: 0,
            completion_reported: false,
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn restart_clock(&mut self) {
        self.replay_elapsed_micros = 0;
    }

    pub fn has_pending_events(&self) -> bool {
        self.next_event_index < self.events.len()
    }

    /// Advance the timeline and take every event now due, in trace order.
    pub fn advance_and_take_ready_events(&mut self, delta_micros: u64) -> Vec<TraceEvent> {
        self.replay_elapsed_micros = self
            .replay_elapsed_micros
            .checked_add(delta_micros)
            .unwrap_or_else(|| panic!("trace replay timeline overflow"));
        let mut ready = Vec::new();
        while let Some(event) = self.events.get(self.next_event_index) {
            if event.elapsed_micros > self.replay_elapsed_micros {
                break;
            }
            ready.push(event.clone());
            self.next_event_index += 1;
        }
        ready
    }

    /// True exactly once, on the first call after the last event was taken.
    pub fn take_completion_notice(&mut self) -> bool {
        if self.has_pending_events() || self.completion_reported {
            return false;
        }
        self.completion_reported = true;
        true
    }
}
