use std::collections::HashMap;
use std::time::{Duration, Instant};

use shims::EventRecord;
use smol_str::SmolStr;

use crate::EventStream;

/// Roughly two frames at 60 fps.
pub const DEFAULT_THROTTLE_INTERVAL: Duration = Duration::from_micros(33_340);

/// High-frequency event types that are coalesced before forwarding.
pub const DEFAULT_THROTTLED_EVENTS: [&str; 4] = ["mousemove", "wheel", "touchmove", "resize"];

struct Slot {
    last_emitted: Instant,
    trailing: Option<EventRecord>,
}

/// Leading-edge throttle with a single trailing event per `(stream, type)`.
///
/// The first event of a burst passes immediately. Later events within the
/// interval replace each other; the last one is released by
/// [`EventThrottle::flush_due`] once the interval has elapsed.
pub struct EventThrottle {
    interval: Duration,
    kinds: Vec<SmolStr>,
    slots: HashMap<(EventStream, SmolStr), Slot>,
}

impl Default for EventThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE_INTERVAL, DEFAULT_THROTTLED_EVENTS)
    }
}

impl EventThrottle {
    pub fn new<I, S>(interval: Duration, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        Self {
            interval,
            kinds: kinds.into_iter().map(Into::into).collect(),
            slots: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_throttled(&self, kind: &str) -> bool {
        !self.interval.is_zero() && self.kinds.iter().any(|throttled| throttled == kind)
    }

    /// Returns the record when it may be forwarded now.
    pub fn offer(
        &mut self,
        stream: EventStream,
        record: EventRecord,
        now: Instant,
    ) -> Option<EventRecord> {
        if !self.is_throttled(&record.kind) {
            return Some(record);
        }
        let key = (stream, record.kind.clone());
        match self.slots.get_mut(&key) {
            Some(slot) if now.saturating_duration_since(slot.last_emitted) < self.interval => {
                slot.trailing = Some(record);
                None
            }
            Some(slot) => {
                slot.last_emitted = now;
                slot.trailing = None;
                Some(record)
            }
            None => {
                self.slots.insert(
                    key,
                    Slot {
                        last_emitted: now,
                        trailing: None,
                    },
                );
                Some(record)
            }
        }
    }

    /// Trailing events whose interval has elapsed, oldest slot first.
    pub fn flush_due(&mut self, now: Instant) -> Vec<(EventStream, EventRecord)> {
        let interval = self.interval;
        let mut due: Vec<(Instant, EventStream, EventRecord)> = Vec::new();
        for ((stream, _), slot) in &mut self.slots {
            if slot.trailing.is_none()
                || now.saturating_duration_since(slot.last_emitted) < interval
            {
                continue;
            }
            if let Some(record) = slot.trailing.take() {
                due.push((slot.last_emitted, *stream, record));
                slot.last_emitted = now;
            }
        }
        due.sort_by_key(|(emitted, _, _)| *emitted);
        due.into_iter()
            .map(|(_, stream, record)| (stream, record))
            .collect()
    }

    /// When the earliest pending trailing event becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.trailing.is_some())
            .map(|slot| slot.last_emitted + self.interval)
            .min()
    }

    pub fn pending(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.trailing.is_some())
            .count()
    }
}
