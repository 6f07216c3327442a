//! JSONL traces of host events observed by Main, for recording a session and
//! replaying it on a simulated timeline.

mod recorder;
mod replay;

use std::io::{BufRead, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use shims::EventRecord;

pub use recorder::TraceRecorder;
pub use replay::TraceReplay;

pub const TRACE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStream {
    Window,
    Document,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub schema_version: u32,
    pub event_id: u64,
    pub elapsed_micros: u64,
    pub stream: TraceStream,
    pub record: EventRecord,
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("open trace file '{path}': {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("trace io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid trace json at line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("encode trace event: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("unsupported trace schema version {version} at line {line}")]
    UnsupportedSchema { line: usize, version: u32 },
    #[error("non-monotonic trace event_id at line {line}: {current} <= {previous}")]
    EventIdNotIncreasing {
        line: usize,
        previous: u64,
        current: u64,
    },
    #[error("non-monotonic trace elapsed_micros at line {line}: {current} < {previous}")]
    ElapsedDecreased {
        line: usize,
        previous: u64,
        current: u64,
    },
}

pub fn write_jsonl_event_line(writer: &mut dyn Write, event: &TraceEvent) -> Result<(), TraceError> {
    serde_json::to_writer(&mut *writer, event).map_err(TraceError::Encode)?;
    writer.write_all(b"\n")?;
    Ok(())
}

/// Read and validate every event. Blank lines are skipped.
pub fn read_jsonl_events(reader: &mut dyn BufRead) -> Result<Vec<TraceEvent>, TraceError> {
    let mut events: Vec<TraceEvent> = Vec::new();
    let mut line_buffer = String::new();
    let mut line = 0usize;
    loop {
        line_buffer.clear();
        if reader.read_line(&mut line_buffer)? == 0 {
            break;
        }
        line = line
            .checked_add(1)
            .unwrap_or_else(|| panic!("trace line number overflow"));
        if line_buffer.trim().is_empty() {
            continue;
        }
        let event = serde_json::from_str::<TraceEvent>(&line_buffer)
            .map_err(|source| TraceError::Parse { line, source })?;
        if event.schema_version != TRACE_SCHEMA_VERSION {
            return Err(TraceError::UnsupportedSchema {
                line,
                version: event.schema_version,
            });
        }
        if let Some(previous) = events.last() {
            if event.event_id <= previous.event_id {
                return Err(TraceError::EventIdNotIncreasing {
                    line,
                    previous: previous.event_id,
                    current: event.event_id,
                });
            }
            if event.elapsed_micros < previous.elapsed_micros {
                return Err(TraceError::ElapsedDecreased {
                    line,
                    previous: previous.elapsed_micros,
                    current: event.elapsed_micros,
                });
            }
        }
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn event_line_keeps_record_type_inline() {
        let event = TraceEvent {
            schema_version: TRACE_SCHEMA_VERSION,
            event_id: 1,
            elapsed_micros: 250,
            stream: TraceStream::Document,
            record: EventRecord::new("keydown").with("keyCode", 32),
        };
        let mut buffer = Vec::new();
        write_jsonl_event_line(&mut buffer, &event)
            .unwrap_or_else(|error| panic!("write trace line: {error}"));
        let parsed: Value = serde_json::from_slice(&buffer)
            .unwrap_or_else(|error| panic!("parse trace line: {error}"));
        assert_eq!(parsed["stream"], json!("document"));
        assert_eq!(parsed["record"], json!({ "type": "keydown", "keyCode": 32 }));
    }

    #[test]
    fn read_rejects_non_monotonic_event_ids() {
        let lines = [
            r#"{"schema_version":1,"event_id":2,"elapsed_micros":0,"stream":"window","record":{"type":"blur"}}"#,
            r#"{"schema_version":1,"event_id":2,"elapsed_micros":5,"stream":"window","record":{"type":"focus"}}"#,
        ];
        let mut reader = Cursor::new(lines.join("\n"));
        assert!(matches!(
            read_jsonl_events(&mut reader),
            Err(TraceError::EventIdNotIncreasing {
                line: 2,
                previous: 2,
                current: 2
            })
        ));
    }

    #[test]
    fn read_rejects_time_going_backwards_and_unknown_schema() {
        let backwards = [
            r#"{"schema_version":1,"event_id":1,"elapsed_micros":10,"stream":"window","record":{"type":"blur"}}"#,
            "",
            r#"{"schema_version":1,"event_id":2,"elapsed_micros":5,"stream":"window","record":{"type":"focus"}}"#,
        ];
        assert!(matches!(
            read_jsonl_events(&mut Cursor::new(backwards.join("\n"))),
            Err(TraceError::ElapsedDecreased { line: 3, .. })
        ));

        let future = r#"{"schema_version":9,"event_id":1,"elapsed_micros":0,"stream":"window","record":{"type":"blur"}}"#;
        assert!(matches!(
            read_jsonl_events(&mut Cursor::new(future)),
            Err(TraceError::UnsupportedSchema { line: 1, version: 9 })
        ));
    }
}
