use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use shims::EventRecord;
use tracing::warn;

use crate::{TRACE_SCHEMA_VERSION, TraceError, TraceEvent, TraceStream, write_jsonl_event_line};

const TRACE_RECORDER_FLUSH_EVERY_EVENTS: u32 = 128;

pub struct TraceRecorder {
    started_at: Instant,
    writer: Box<dyn Write>,
    next_event_id: u64,
    last_elapsed_micros: u64,
    pending_events_since_flush: u32,
}

impl TraceRecorder {
    pub fn from_path(path: &Path) -> Result<Self, TraceError> {
        let file = File::create(path).map_err(|source| TraceError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(Box::new(BufWriter::new(file))))
    }

    pub fn new(writer: Box<dyn Write>) -> Self {
        Self {
            started_at: Instant::now(),
            writer,
            next_event_id: 1,
            last_elapsed_micros: 0,
            pending_events_since_flush: 0,
        }
    }

    pub fn recorded_events(&self) -> u64 {
        self.next_event_id - 1
    }

    /// Record with the wall-clock time since the recorder was created.
    pub fn record(&mut self, stream: TraceStream, record: &EventRecord) -> Result<(), TraceError> {
        let elapsed_micros = u64::try_from(self.started_at.elapsed().as_micros())
            .unwrap_or_else(|_| panic!("trace timestamp overflow"));
        self.record_at(elapsed_micros, stream, record)
    }

    /// Record at an explicit offset. Offsets earlier than the last recorded
    /// one are clamped so the trace stays monotonic.
    pub fn record_at(
        &mut self,
        elapsed_micros: u64,
        stream: TraceStream,
        record: &EventRecord,
    ) -> Result<(), TraceError> {
        let elapsed_micros = elapsed_micros.max(self.last_elapsed_micros);
        let event = TraceEvent {
            schema_version: TRACE_SCHEMA_VERSION,
            event_id: self.next_event_id,
            elapsed_micros,
            stream,
            record: record.clone(),
        };
        write_jsonl_event_line(&mut *self.writer, &event)?;
        self.next_event_id = self
            .next_event_id
            .checked_add(1)
            .unwrap_or_else(|| panic!("trace event id overflow"));
        self.last_elapsed_micros = elapsed_micros;
        self.pending_events_since_flush = self
            .pending_events_since_flush
            .checked_add(1)
            .unwrap_or_else(|| panic!("trace pending event counter overflow"));
        if self.pending_events_since_flush >= TRACE_RECORDER_FLUSH_EVERY_EVENTS {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TraceError> {
        self.writer.flush()?;
        self.pending_events_since_flush = 0;
        Ok(())
    }
}

impl Drop for TraceRecorder {
    fn drop(&mut self) {
        if self.pending_events_since_flush == 0 {
            return;
        }
        if let Err(error) = self.flush() {
            warn!(target: "event_trace", %error, "flush event trace on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn recorder_writes_jsonl_with_increasing_ids() {
        let base = std::env::temp_dir().join(format!("event_trace_recorder_{}", std::process::id()));
        fs::create_dir_all(&base)
            .unwrap_or_else(|error| panic!("create temp test dir '{}': {error}", base.display()));
        let path = base.join("events.jsonl");
        {
            let mut recorder = TraceRecorder::from_path(&path)
                .unwrap_or_else(|error| panic!("create recorder: {error}"));
            recorder
                .record_at(100, TraceStream::Window, &EventRecord::new("resize").with("innerWidth", 640))
                .unwrap_or_else(|error| panic!("record resize: {error}"));
            recorder
                .record_at(50, TraceStream::Document, &EventRecord::new("keydown"))
                .unwrap_or_else(|error| panic!("record keydown: {error}"));
            assert_eq!(recorder.recorded_events(), 2);
        }

        let content = fs::read_to_string(&path)
            .unwrap_or_else(|error| panic!("read trace '{}': {error}", path.display()));
        let lines: Vec<Value> = content
            .lines()
            .map(|line| {
                serde_json::from_str(line).unwrap_or_else(|error| panic!("parse line: {error}"))
            })
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event_id"], json!(1));
        assert_eq!(lines[0]["record"]["innerWidth"], json!(640));
        assert_eq!(lines[1]["event_id"], json!(2));
        assert_eq!(lines[1]["elapsed_micros"], json!(100));
        assert_eq!(lines[1]["stream"], json!("document"));

        let _ = fs::remove_dir_all(&base);
    }
}
