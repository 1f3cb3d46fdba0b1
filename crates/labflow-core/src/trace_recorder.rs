//! Trace recorder: the single, append-only writer of a run's trace.
//!
//! Each event is serialized as one JSON line and flushed immediately so an
//! external reader can tail the file while the run is in progress.

use crate::TraceError;
use chrono::{SecondsFormat, Utc};
use labflow_proto::{EventKind, PartId, TraceEvent};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

type Observer = Box<dyn Fn(&TraceEvent) + Send>;

/// Records trace events to a JSONL output.
///
/// Sequence numbers start at the value given on construction and advance by
/// one per successfully written event, so a trace never has gaps. A failed
/// write leaves the sequence unchanged and is reported to the caller.
///
/// # Example
///
/// ```
/// use labflow_core::TraceRecorder;
/// use labflow_proto::{EventKind, PartId};
///
/// let mut output = Vec::new();
/// let mut recorder = TraceRecorder::new(&mut output);
/// recorder
///     .record(&PartId::new("start"), EventKind::PartCompleted { next: Some(PartId::terminal()) })
///     .unwrap();
/// drop(recorder);
///
/// let text = String::from_utf8_lossy(&output);
/// assert!(text.contains("\"event_kind\":\"part_completed\""));
/// ```
pub struct TraceRecorder<W> {
    writer: W,
    next_sequence: u64,
    observers: Vec<Observer>,
}

impl TraceRecorder<BufWriter<File>> {
    /// Creates (or truncates) a trace file for a new run.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Creating trace file");
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }

    /// Opens an existing trace for appending, continuing at `next_sequence`.
    ///
    /// Prior bytes are never rewritten. If the file does not end in a newline
    /// (a write torn by a crash), one is added first so the fragment stays on
    /// its own line, where readers skip it.
    pub fn append(path: impl AsRef<Path>, next_sequence: u64) -> Result<Self, TraceError> {
        let path = path.as_ref();
        let mut file = OpenOptions::new().read(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::Start(len - 1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "Trace ends with a partial line; starting a new line");
                file.write_all(b"\n")?;
            }
        }
        debug!(path = %path.display(), next_sequence, "Appending to trace file");
        Ok(Self::with_start(BufWriter::new(file), next_sequence))
    }
}

impl<W: Write> TraceRecorder<W> {
    /// Creates a recorder for a fresh trace.
    pub fn new(writer: W) -> Self {
        Self::with_start(writer, 0)
    }

    /// Creates a recorder whose first event gets `next_sequence`.
    pub fn with_start(writer: W, next_sequence: u64) -> Self {
        Self {
            writer,
            next_sequence,
            observers: Vec::new(),
        }
    }

    /// Adds an observer called with every event after it is flushed.
    pub fn add_observer<F>(&mut self, observer: F)
    where
        F: Fn(&TraceEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Appends one event, returning its sequence number.
    pub fn record(&mut self, part_id: &PartId, kind: EventKind) -> Result<u64, TraceError> {
        let event = TraceEvent::new(
            self.next_sequence,
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            part_id.clone(),
            kind,
        );
        let line = serde_json::to_string(&event)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        self.next_sequence += 1;

        for observer in &self.observers {
            observer(&event);
        }
        Ok(event.sequence_no)
    }

    /// The sequence number the next event will get.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labflow_proto::PartKind;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn started() -> EventKind {
        EventKind::PartStarted {
            variant: PartKind::Step,
            type_name: "step.set".to_string(),
            policy: None,
        }
    }

    #[test]
    fn test_jsonl_format_and_sequence() {
        let mut output = Vec::new();
        {
            let mut recorder = TraceRecorder::new(&mut output);
            let id = PartId::new("start");
            assert_eq!(recorder.record(&id, started()).unwrap(), 0);
            assert_eq!(
                recorder
                    .record(
                        &id,
                        EventKind::DataWritten {
                            key: "x".to_string(),
                            value: json!(1),
                        },
                    )
                    .unwrap(),
                1
            );
            assert_eq!(recorder.next_sequence(), 2);
        }

        let text = String::from_utf8_lossy(&output);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for (i, line) in lines.iter().enumerate() {
            let event: TraceEvent = serde_json::from_str(line).unwrap();
            assert_eq!(event.sequence_no, i as u64);
        }
    }

    #[test]
    fn test_observers_see_each_event() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut recorder = TraceRecorder::new(Vec::new());
        recorder.add_observer(move |event| sink.lock().unwrap().push(event.sequence_no));
        recorder.record(&PartId::new("a"), started()).unwrap();
        recorder.record(&PartId::new("b"), started()).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_append_continues_sequence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        {
            let mut recorder = TraceRecorder::create(&path).unwrap();
            recorder.record(&PartId::new("a"), started()).unwrap();
        }
        {
            let mut recorder = TraceRecorder::append(&path, 1).unwrap();
            assert_eq!(recorder.record(&PartId::new("b"), started()).unwrap(), 1);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_append_isolates_torn_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("trace.jsonl");
        {
            let mut recorder = TraceRecorder::create(&path).unwrap();
            recorder.record(&PartId::new("a"), started()).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"sequence_no\":1,\"timest").unwrap();
        drop(file);

        {
            let mut recorder = TraceRecorder::append(&path, 1).unwrap();
            recorder.record(&PartId::new("b"), started()).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("{\"sequence_no\":1,\"timest"));
        let last: TraceEvent = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last.sequence_no, 1);
    }
}
