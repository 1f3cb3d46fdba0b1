//! Reading traces: whole-file loading and incremental tailing.

use crate::TraceError;
use labflow_proto::TraceEvent;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Information about a trace line that failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedLine {
    /// Line number in the file (1-indexed).
    pub line_number: u64,
    /// The raw content (truncated if very long).
    pub content: String,
    pub error: String,
}

impl MalformedLine {
    const MAX_CONTENT_CHARS: usize = 100;

    pub fn new(line_number: u64, content: &str, error: String) -> Self {
        let content = if content.chars().count() > Self::MAX_CONTENT_CHARS {
            let head: String = content.chars().take(Self::MAX_CONTENT_CHARS).collect();
            format!("{head}...")
        } else {
            content.to_string()
        };
        Self {
            line_number,
            content,
            error,
        }
    }
}

/// A fully loaded trace.
///
/// Lines that do not parse are skipped and kept as [`MalformedLine`]s; they
/// are expected only where a crash tore a write. The parsed events must carry
/// gap-free sequence numbers starting at 0.
#[derive(Debug, Clone, Default)]
pub struct TraceLog {
    events: Vec<TraceEvent>,
    malformed: Vec<MalformedLine>,
}

impl TraceLog {
    /// Loads a trace from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading trace");
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parses a trace from any buffered reader.
    pub fn from_reader<R: BufRead>(mut reader: R) -> Result<Self, TraceError> {
        let mut log = Self::default();
        let mut raw = Vec::new();
        let mut line_number = 0;

        loop {
            raw.clear();
            if reader.read_until(b'\n', &mut raw)? == 0 {
                break;
            }
            line_number += 1;

            match parse_line(line_number, &raw) {
                None => {}
                Some(Ok(event)) => {
                    let expected = log.next_sequence();
                    if event.sequence_no != expected {
                        return Err(TraceError::SequenceGap {
                            line: line_number,
                            expected,
                            found: event.sequence_no,
                        });
                    }
                    log.events.push(event);
                }
                Some(Err(malformed)) => log.malformed.push(malformed),
            }
        }

        debug!(
            events = log.events.len(),
            malformed = log.malformed.len(),
            "Trace loaded"
        );
        Ok(log)
    }

    /// Builds a log from events already in memory.
    pub fn from_events(events: Vec<TraceEvent>) -> Self {
        Self {
            events,
            malformed: Vec::new(),
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    pub fn malformed(&self) -> &[MalformedLine] {
        &self.malformed
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The sequence number an appended event must get.
    pub fn next_sequence(&self) -> u64 {
        self.events.last().map_or(0, |e| e.sequence_no + 1)
    }

    /// Events for a part and everything nested inside it.
    pub fn filter_by_part<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a TraceEvent> {
        self.events.iter().filter(move |e| {
            let id = e.part_id.as_str();
            id == prefix
                || (id.len() > prefix.len()
                    && id.starts_with(prefix)
                    && id.as_bytes()[prefix.len()] == b'.')
        })
    }

    /// Events of one kind, by wire name (`"data_written"`, ...).
    pub fn filter_by_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a TraceEvent> {
        self.events.iter().filter(move |e| e.kind_name() == kind)
    }

    /// Number of events per kind.
    pub fn counts_by_kind(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for event in &self.events {
            *counts.entry(event.kind_name()).or_insert(0) += 1;
        }
        counts
    }
}

/// Events read by one [`TraceTail::read_new`] call.
#[derive(Debug, Clone, Default)]
pub struct TailBatch {
    pub events: Vec<TraceEvent>,
    pub malformed: Vec<MalformedLine>,
}

/// Reads a growing trace incrementally.
///
/// Only complete (newline-terminated) lines are consumed, so a line the
/// recorder is still writing is picked up by a later call.
pub struct TraceTail {
    path: PathBuf,
    position: u64,
    line_number: u64,
}

impl TraceTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            position: 0,
            line_number: 0,
        }
    }

    /// Reads events appended since the last call.
    pub fn read_new(&mut self) -> std::io::Result<TailBatch> {
        let mut batch = TailBatch::default();
        if !self.path.exists() {
            return Ok(batch);
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.position))?;
        let mut reader = BufReader::new(file);
        let mut raw = Vec::new();

        loop {
            raw.clear();
            let read = reader.read_until(b'\n', &mut raw)?;
            if read == 0 || raw.last() != Some(&b'\n') {
                break;
            }
            self.position += read as u64;
            self.line_number += 1;

            match parse_line(self.line_number, &raw) {
                None => {}
                Some(Ok(event)) => batch.events.push(event),
                Some(Err(malformed)) => batch.malformed.push(malformed),
            }
        }

        Ok(batch)
    }

    /// Current byte offset into the file.
    pub fn position(&self) -> u64 {
        self.position
    }
}

/// Parses one raw line; `None` for a blank one. Bytes are parsed as they
/// are, so a line torn inside a multi-byte character is malformed rather
/// than an I/O error.
fn parse_line(line_number: u64, raw: &[u8]) -> Option<Result<TraceEvent, MalformedLine>> {
    let raw = raw.trim_ascii();
    if raw.is_empty() {
        return None;
    }
    Some(serde_json::from_slice::<TraceEvent>(raw).map_err(|e| {
        warn!(error = %e, line_number, "Skipping malformed trace line");
        MalformedLine::new(line_number, &String::from_utf8_lossy(raw), e.to_string())
    }))
}
