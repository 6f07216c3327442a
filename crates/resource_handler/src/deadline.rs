use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::TimerScheduler;

struct Deadline {
    due: Instant,
    sequence: u64,
    task: Box<dyn FnOnce()>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.sequence == other.sequence
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    // Max-heap: the earliest deadline, then the earliest scheduled, pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Timers drained cooperatively by the owning loop. Nothing runs until
/// [`DeadlineQueue::fire_due`] is called.
pub struct DeadlineQueue {
    clock: Box<dyn Fn() -> Instant>,
    heap: RefCell<BinaryHeap<Deadline>>,
    next_sequence: Cell<u64>,
}

impl Default for DeadlineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::with_clock(Instant::now)
    }

    pub fn with_clock(clock: impl Fn() -> Instant + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            heap: RefCell::new(BinaryHeap::new()),
            next_sequence: Cell::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.borrow().is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.borrow().peek().map(|deadline| deadline.due)
    }

    /// Time until the next deadline, zero if one is already due.
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = (self.clock)();
        self.next_deadline()
            .map(|due| due.saturating_duration_since(now))
    }

    /// Run every task due by now. Tasks scheduled while firing wait for the
    /// next call. Returns how many ran.
    pub fn fire_due(&self) -> usize {
        let now = (self.clock)();
        let mut due_tasks = Vec::new();
        {
            let mut heap = self.heap.borrow_mut();
            while heap.peek().is_some_and(|deadline| deadline.due <= now) {
                if let Some(deadline) = heap.pop() {
                    due_tasks.push(deadline.task);
                }
            }
        }
        let fired = due_tasks.len();
        for task in due_tasks {
            task();
        }
        fired
    }

    pub fn clear(&self) {
        self.heap.borrow_mut().clear();
    }
}

impl TimerScheduler for DeadlineQueue {
    fn schedule(&self, after: Duration, task: Box<dyn FnOnce()>) {
        let sequence = self.next_sequence.get();
        self.next_sequence.set(
            sequence
                .checked_add(1)
                .unwrap_or_else(|| panic!("deadline sequence overflow")),
        );
        let due = (self.clock)() + after;
        self.heap.borrow_mut().push(Deadline { due, sequence, task });
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;

    #[test]
    fn tasks_fire_in_deadline_then_schedule_order() {
        let start = Instant::now();
        let clock = Rc::new(Cell::new(start));
        let clock_source = clock.clone();
        let queue = DeadlineQueue::with_clock(move || clock_source.get());
        let order = Rc::new(RefCell::new(Vec::new()));

        for (label, millis) in [("late", 30), ("early", 10), ("tie", 10)] {
            let order = order.clone();
            queue.schedule(
                Duration::from_millis(millis),
                Box::new(move || order.borrow_mut().push(label)),
            );
        }
        assert_eq!(queue.next_deadline(), Some(start + Duration::from_millis(10)));
        assert_eq!(queue.time_until_next(), Some(Duration::from_millis(10)));

        clock.set(start + Duration::from_millis(10));
        assert_eq!(queue.fire_due(), 2);
        clock.set(start + Duration::from_millis(40));
        assert_eq!(queue.fire_due(), 1);
        assert_eq!(*order.borrow(), vec!["early", "tie", "late"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn task_scheduled_while_firing_waits_for_next_pass() {
        let queue = Rc::new(DeadlineQueue::new());
        let inner_queue = queue.clone();
        queue.schedule(
            Duration::ZERO,
            Box::new(move || inner_queue.schedule(Duration::ZERO, Box::new(|| {}))),
        );
        assert_eq!(queue.fire_due(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.fire_due(), 1);
        assert!(queue.is_empty());
    }
}
