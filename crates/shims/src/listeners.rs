use smol_str::SmolStr;
use tracing::trace;

use crate::{EventRecord, ListenerId};

pub type Handler = Box<dyn FnMut(&EventRecord)>;

pub struct ListenerEntry {
    pub id: ListenerId,
    pub kind: SmolStr,
    handler: Handler,
}

impl std::fmt::Debug for ListenerEntry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ListenerEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Ordered listener table. Insertion order is firing order; the same
/// handler registered twice fires twice.
#[derive(Debug, Default)]
pub struct ListenerTable {
    entries: Vec<ListenerEntry>,
    next_id: u64,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: impl Into<SmolStr>, handler: Handler) -> ListenerId {
        self.next_id = self
            .next_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("listener id overflow"));
        let id = ListenerId(self.next_id);
        self.entries.push(ListenerEntry {
            id,
            kind: kind.into(),
            handler,
        });
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_for(&self, kind: &str) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }

    /// Invoke every listener registered for `record.kind`. Returns how many ran.
    pub fn dispatch(&mut self, record: &EventRecord) -> usize {
        let mut invoked = 0;
        for entry in self.entries.iter_mut().filter(|entry| entry.kind == record.kind) {
            (entry.handler)(record);
            invoked += 1;
        }
        trace!(target: "shim", kind = %record.kind, invoked, "dispatched");
        invoked
    }
}
