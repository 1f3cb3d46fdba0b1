//! Trace replay: rebuilds the store and the resume position from a trace.
//!
//! Replay folds the events in order and never invokes part logic. Writes
//! made inside a parallel flow are held back until that flow's
//! `part_completed` event, so a run that stopped before the merge replays
//! to the store as it was at the fork.

use crate::manager::TerminationReason;
use crate::{DataStore, TraceLog};
use labflow_proto::{
    EventKind, ExecutionPolicy, FailureKind, ManualResolution, PartId, PartKind, Resolution,
    ResolutionRequest, TraceEvent, Value,
};
use std::fmt;

/// Where a replayed run stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayCursor {
    /// Nothing recorded yet.
    Fresh,
    /// This part runs next; it may have started without completing.
    At(PartId),
    /// The innermost open flow is being left.
    Leave,
    /// The part completed but its successor did not resolve.
    Unresolved(PartId),
    /// A failure is recorded but no resolution was requested yet.
    Failed {
        part: PartId,
        kind: FailureKind,
        message: String,
    },
    /// A resolution was requested and never answered.
    Pending(ResolutionRequest),
    /// The run already ended.
    Finished(TerminationReason),
}

/// One line of the path a run took, for audit output.
#[derive(Debug, Clone, PartialEq)]
pub enum PathEntry {
    Started {
        part: PartId,
        variant: PartKind,
    },
    Decided {
        part: PartId,
        route: String,
        target: Option<PartId>,
    },
    Failed {
        part: PartId,
        kind: FailureKind,
        message: String,
    },
    Awaiting {
        part: PartId,
        kind: FailureKind,
    },
    Resolved {
        part: PartId,
        choice: Resolution,
    },
}

impl fmt::Display for PathEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathEntry::Started { part, variant } => write!(f, "{part} ({})", variant.as_str()),
            PathEntry::Decided {
                part,
                route,
                target,
            } => match target {
                Some(target) => write!(f, "{part} chose '{route}' -> {target}"),
                None => write!(f, "{part} chose '{route}' -> (unresolved)"),
            },
            PathEntry::Failed {
                part,
                kind,
                message,
            } => write!(f, "{part} failed [{kind}]: {message}"),
            PathEntry::Awaiting { part, kind } => {
                write!(f, "{part} awaiting resolution [{kind}]")
            }
            PathEntry::Resolved { part, choice } => match choice {
                Resolution::Part { part_id } => write!(f, "{part} resolved: go to {part_id}"),
                Resolution::LeaveFlow => write!(f, "{part} resolved: leave flow"),
                Resolution::EndExperiment => write!(f, "{part} resolved: end experiment"),
            },
        }
    }
}

/// A flow that has started and not completed.
#[derive(Debug)]
struct Frame {
    flow: PartId,
    policy: ExecutionPolicy,
    /// Writes held back until a parallel flow completes.
    held: Vec<(String, Value)>,
}

/// The state a trace describes.
///
/// # Example
///
/// ```
/// use labflow_core::{DataStore, Replay, ReplayCursor, TraceLog};
/// use std::io::Cursor;
///
/// let jsonl = concat!(
///     r#"{"sequence_no":0,"timestamp":"t","part_id":"start","event_kind":"part_started","payload":{"variant":"step","type_name":"step.set"}}"#, "\n",
///     r#"{"sequence_no":1,"timestamp":"t","part_id":"start","event_kind":"data_written","payload":{"key":"x","value":10}}"#, "\n",
///     r#"{"sequence_no":2,"timestamp":"t","part_id":"start","event_kind":"part_completed","payload":{"next":"quit"}}"#, "\n",
/// );
/// let log = TraceLog::from_reader(Cursor::new(jsonl)).unwrap();
/// let replay = Replay::from_log(&log, DataStore::new());
///
/// assert_eq!(replay.store().get("x"), Some(&serde_json::json!(10)));
/// assert!(replay.is_finished());
/// ```
#[derive(Debug, Clone)]
pub struct Replay {
    store: DataStore,
    frames: Vec<PartId>,
    cursor: ReplayCursor,
    next_sequence: u64,
    path: Vec<PathEntry>,
    discarded_writes: usize,
}

impl Replay {
    /// Replays a parsed trace on top of the experiment's initial store.
    pub fn from_log(log: &TraceLog, initial: DataStore) -> Self {
        let mut replay = Self::from_events(log.events(), initial);
        replay.next_sequence = log.next_sequence();
        replay
    }

    pub fn from_events(events: &[TraceEvent], initial: DataStore) -> Self {
        let mut store = initial;
        let mut frames: Vec<Frame> = Vec::new();
        let mut cursor = ReplayCursor::Fresh;
        let mut path = Vec::new();
        let mut discarded_writes = 0;

        for event in events {
            let part = &event.part_id;
            match &event.kind {
                EventKind::PartStarted {
                    variant, policy, ..
                } => {
                    // Starting a part closes every frame it is not nested in.
                    while let Some(top) = frames.last() {
                        if part.is_within(&top.flow) {
                            break;
                        }
                        if let Some(dropped) = frames.pop() {
                            discarded_writes += dropped.held.len();
                        }
                    }
                    if *variant == PartKind::Flow {
                        frames.push(Frame {
                            flow: part.clone(),
                            policy: policy.unwrap_or(ExecutionPolicy::Sequential),
                            held: Vec::new(),
                        });
                    }
                    cursor = ReplayCursor::At(part.clone());
                    path.push(PathEntry::Started {
                        part: part.clone(),
                        variant: *variant,
                    });
                }
                EventKind::PartCompleted { next } => {
                    if let Some(depth) = frames.iter().rposition(|f| f.flow == *part) {
                        let mut closed = frames.split_off(depth);
                        let flow = closed.remove(0);
                        discarded_writes += closed.iter().map(|f| f.held.len()).sum::<usize>();
                        for (key, value) in flow.held {
                            write(&mut frames, &mut store, key, value);
                        }
                    }
                    cursor = match next {
                        None => ReplayCursor::Unresolved(part.clone()),
                        Some(next) if next.is_terminal() => {
                            ReplayCursor::Finished(TerminationReason::Completed)
                        }
                        Some(next) if next.is_leave_flow() => ReplayCursor::Leave,
                        Some(next) => ReplayCursor::At(next.clone()),
                    };
                }
                EventKind::DataWritten { key, value } => {
                    write(&mut frames, &mut store, key.clone(), value.clone());
                }
                EventKind::DecisionTaken { route, target } => {
                    path.push(PathEntry::Decided {
                        part: part.clone(),
                        route: route.clone(),
                        target: target.clone(),
                    });
                }
                EventKind::ErrorRaised { kind, message } => {
                    if kind.requires_resolution() {
                        cursor = ReplayCursor::Failed {
                            part: part.clone(),
                            kind: *kind,
                            message: message.clone(),
                        };
                    }
                    path.push(PathEntry::Failed {
                        part: part.clone(),
                        kind: *kind,
                        message: message.clone(),
                    });
                }
                EventKind::ManualResolution(ManualResolution::Pending {
                    kind,
                    reason,
                    legal_choices,
                }) => {
                    cursor = ReplayCursor::Pending(ResolutionRequest {
                        part_id: part.clone(),
                        kind: *kind,
                        failure_reason: reason.clone(),
                        legal_choices: legal_choices.clone(),
                    });
                    path.push(PathEntry::Awaiting {
                        part: part.clone(),
                        kind: *kind,
                    });
                }
                EventKind::ManualResolution(ManualResolution::Resolved { choice }) => {
                    cursor = match choice {
                        Resolution::Part { part_id } => ReplayCursor::At(part_id.clone()),
                        Resolution::LeaveFlow => ReplayCursor::Leave,
                        Resolution::EndExperiment => {
                            ReplayCursor::Finished(TerminationReason::EndedByResearcher)
                        }
                    };
                    path.push(PathEntry::Resolved {
                        part: part.clone(),
                        choice: choice.clone(),
                    });
                }
            }
        }

        // A parallel flow that never merged runs again from its fork.
        if !matches!(cursor, ReplayCursor::Finished(_))
            && let Some(open) = frames
                .iter()
                .position(|f| f.policy == ExecutionPolicy::Parallel)
        {
            let restart = frames[open].flow.clone();
            discarded_writes += frames[open..].iter().map(|f| f.held.len()).sum::<usize>();
            frames.truncate(open);
            cursor = ReplayCursor::At(restart);
        }
        // A flow that is next to run starts over from its own scope.
        if let ReplayCursor::At(next) = &cursor {
            while frames.last().is_some_and(|f| f.flow == *next) {
                frames.pop();
            }
        }
        if cursor == ReplayCursor::Leave && frames.is_empty() {
            cursor = ReplayCursor::Finished(TerminationReason::LeftTopLevel);
        }

        Self {
            store,
            frames: frames.into_iter().map(|f| f.flow).collect(),
            cursor,
            next_sequence: events.last().map_or(0, |e| e.sequence_no + 1),
            path,
            discarded_writes,
        }
    }

    /// The store as of the last merged event.
    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn into_store(self) -> DataStore {
        self.store
    }

    /// Open sequential flows, outermost first.
    pub fn frames(&self) -> &[PartId] {
        &self.frames
    }

    pub fn cursor(&self) -> &ReplayCursor {
        &self.cursor
    }

    /// Sequence number the next appended event must carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn path(&self) -> &[PathEntry] {
        &self.path
    }

    /// Writes of parallel flows that never merged.
    pub fn discarded_writes(&self) -> usize {
        self.discarded_writes
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.cursor, ReplayCursor::Finished(_))
    }

    /// Parts in the order they started.
    pub fn started_parts(&self) -> impl Iterator<Item = &PartId> {
        self.path.iter().filter_map(|entry| match entry {
            PathEntry::Started { part, .. } => Some(part),
            _ => None,
        })
    }

    /// The first position where this run started a different part than
    /// `other`, with the part each run started there.
    pub fn divergence(&self, other: &Replay) -> Option<(usize, Option<PartId>, Option<PartId>)> {
        let mut ours = self.started_parts();
        let mut theirs = other.started_parts();
        let mut index = 0;
        loop {
            match (ours.next(), theirs.next()) {
                (None, None) => return None,
                (a, b) if a == b => index += 1,
                (a, b) => return Some((index, a.cloned(), b.cloned())),
            }
        }
    }
}

/// Applies a write to the innermost parallel frame, or the store.
fn write(frames: &mut [Frame], store: &mut DataStore, key: String, value: Value) {
    match frames
        .iter_mut()
        .rev()
        .find(|f| f.policy == ExecutionPolicy::Parallel)
    {
        Some(frame) => frame.held.push((key, value)),
        None => {
            store.set(key, value);
        }
    }
}
