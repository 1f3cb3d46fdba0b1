//! Parallel sub-flows.
//!
//! Every member of a parallel flow runs on its own thread against a copy of
//! the store taken at fork time. Branch events and writes are buffered and
//! only reach the live trace and store when the flow merges, one branch at a
//! time in declaration order. A key written by more than one branch keeps the
//! value of the later branch and the overlap is recorded as a merge conflict.

use crate::experiment::{FlowBody, PartNode};
use crate::manager::TerminationReason;
use crate::transition::{Engine, Exit, Failure, Move, Outcome, Recovery, Scope, Target, Track};
use crate::{DataStore, EngineError};
use labflow_proto::{EventKind, FailureKind, PartError, PartId, StoreRead, Value};
use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

/// A branch's view of the store: the fork snapshot plus its own writes.
#[derive(Debug, Clone)]
pub(crate) struct BranchView {
    base: Arc<DataStore>,
    overlay: HashMap<String, Value>,
}

impl BranchView {
    fn new(base: Arc<DataStore>) -> Self {
        Self {
            base,
            overlay: HashMap::new(),
        }
    }
}

impl StoreRead for BranchView {
    fn get(&self, key: &str) -> Option<&Value> {
        self.overlay.get(key).or_else(|| self.base.get(key))
    }

    fn entries(&self) -> Vec<(String, Value)> {
        let mut merged: BTreeMap<String, Value> = self.base.entries().into_iter().collect();
        merged.extend(self.overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.into_iter().collect()
    }
}

/// The track a branch runs on: nothing leaves it until the merge.
pub(crate) struct BufferTrack {
    view: BranchView,
    events: Vec<(PartId, EventKind)>,
}

impl BufferTrack {
    fn new(base: Arc<DataStore>) -> Self {
        Self {
            view: BranchView::new(base),
            events: Vec::new(),
        }
    }
}

impl Track for BufferTrack {
    fn store(&self) -> &dyn StoreRead {
        &self.view
    }

    fn record(&mut self, part: &PartId, kind: EventKind) -> Result<(), EngineError> {
        self.events.push((part.clone(), kind));
        Ok(())
    }

    fn write_data(&mut self, part: &PartId, key: &str, value: Value) -> Result<(), EngineError> {
        self.events.push((
            part.clone(),
            EventKind::DataWritten {
                key: key.to_string(),
                value: value.clone(),
            },
        ));
        self.view.overlay.insert(key.to_string(), value);
        Ok(())
    }
}

/// Forwards one branch's events to the enclosing track and tracks key owners.
struct MergeTrack<'a> {
    live: &'a mut dyn Track,
    view: BranchView,
    owners: &'a mut HashMap<String, usize>,
    flow: &'a PartId,
    members: &'a [PartId],
    index: usize,
}

impl MergeTrack<'_> {
    fn replay(&mut self, part: PartId, kind: EventKind) -> Result<(), EngineError> {
        match kind {
            EventKind::DataWritten { key, value } => self.write_data(&part, &key, value),
            other => self.live.record(&part, other),
        }
    }
}

impl Track for MergeTrack<'_> {
    fn store(&self) -> &dyn StoreRead {
        &self.view
    }

    fn record(&mut self, part: &PartId, kind: EventKind) -> Result<(), EngineError> {
        self.live.record(part, kind)
    }

    fn write_data(&mut self, part: &PartId, key: &str, value: Value) -> Result<(), EngineError> {
        self.live.write_data(part, key, value.clone())?;
        self.view.overlay.insert(key.to_string(), value);

        if let Some(previous) = self.owners.insert(key.to_string(), self.index)
            && previous != self.index
        {
            let earlier = &self.members[previous];
            let later = &self.members[self.index];
            warn!(flow = %self.flow, %key, %earlier, %later, "Merge conflict");
            self.live.record(
                self.flow,
                EventKind::ErrorRaised {
                    kind: FailureKind::MergeConflict,
                    message: format!(
                        "key '{key}' written by branches '{earlier}' and '{later}'; \
                         the value from '{later}' is kept"
                    ),
                },
            )?;
        }
        Ok(())
    }
}

/// What the barrier collected for one branch.
enum Report {
    Finished {
        result: Result<Exit, EngineError>,
        buffer: BufferTrack,
    },
    Missing(PartError),
}

/// What wakes the barrier.
enum Signal {
    Reported(usize, Report),
    Cancelled,
}

/// Runs a parallel flow: fork, wait at the barrier, merge.
pub(crate) fn run_parallel(
    engine: &Engine,
    track: &mut dyn Track,
    scope: &Scope,
    node: &PartNode,
    body: &FlowBody,
    recovery: Recovery<'_>,
) -> Result<Outcome, EngineError> {
    let flow = &node.id;
    let members = body.members.as_slice();
    let snapshot = Arc::new(track.snapshot());
    let timeout = body.timeout.or_else(|| engine.experiment().branch_timeout());
    info!(flow = %flow, branches = members.len(), "Forking parallel branches");

    let (tx, rx) = mpsc::channel();
    for (index, member) in members.iter().enumerate() {
        let branch_engine = engine.clone();
        let branch_tx = tx.clone();
        let branch_member = member.clone();
        let base = Arc::clone(&snapshot);
        let spawned = thread::Builder::new()
            .name(format!("branch-{member}"))
            .spawn(move || {
                let ran = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut buffer = BufferTrack::new(base);
                    let result = branch_engine.drive(
                        &mut buffer,
                        &Scope::Branch(branch_member.clone()),
                        Move::Run(branch_member),
                        Recovery::Halt,
                    );
                    (result, buffer)
                }));
                let report = match ran {
                    Ok((result, buffer)) => Report::Finished { result, buffer },
                    Err(_) => Report::Missing(PartError::execution("branch thread panicked")),
                };
                // The barrier may have given up on this branch already.
                let _ = branch_tx.send(Signal::Reported(index, report));
            });
        if let Err(e) = spawned {
            warn!(flow = %flow, member = %member, error = %e, "Could not start branch thread");
            let _ = tx.send(Signal::Reported(
                index,
                Report::Missing(PartError::execution(format!(
                    "branch thread could not be started: {e}"
                ))),
            ));
        }
    }
    let _wake = engine.cancel.on_cancel(move || {
        let _ = tx.send(Signal::Cancelled);
    });

    let mut reports: Vec<Option<Report>> = members.iter().map(|_| None).collect();
    let mut pending = members.len();
    let started = Instant::now();
    while pending > 0 {
        if engine.cancel.is_cancelled() {
            abandon(track, members, "branch abandoned: the run was interrupted")?;
            return Ok(Outcome::Exit(Exit::Interrupted));
        }
        let received = match timeout {
            Some(limit) => {
                let left = limit.saturating_sub(started.elapsed());
                if left.is_zero() {
                    warn!(flow = %flow, pending, "Parallel branches timed out");
                    break;
                }
                rx.recv_timeout(left)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(Signal::Reported(index, report)) => {
                debug!(flow = %flow, member = %members[index], "Branch reported");
                if reports[index].replace(report).is_none() {
                    pending -= 1;
                }
            }
            // The flag is checked at the top of the loop.
            Ok(Signal::Cancelled) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let timed_out = timeout.is_some_and(|limit| started.elapsed() >= limit);
    let reports: Vec<Report> = reports
        .into_iter()
        .map(|report| {
            report.unwrap_or_else(|| {
                let reason = match timeout {
                    Some(limit) if timed_out => {
                        format!("branch timed out after {}s", limit.as_secs_f64())
                    }
                    _ => "branch thread exited without reporting".to_string(),
                };
                Report::Missing(PartError::execution(reason))
            })
        })
        .collect();

    if let Recovery::Halt = recovery
        && let Some(outcome) = halted_branch(flow, members, &reports)
    {
        return Ok(outcome);
    }

    merge(engine, track, scope, node, members, &snapshot, reports, recovery)
}

/// Inside a branch nobody can resolve failures, so any failing member fails
/// the whole flow before anything is merged.
fn halted_branch(flow: &PartId, members: &[PartId], reports: &[Report]) -> Option<Outcome> {
    for (member, report) in members.iter().zip(reports) {
        let error = match report {
            Report::Missing(error) => error.clone(),
            Report::Finished { result, .. } => match result {
                Ok(Exit::Halted(failure)) => failure.error.clone(),
                Ok(Exit::Suspended { request, .. }) => {
                    PartError::new(request.kind, request.failure_reason.clone())
                }
                Ok(Exit::Interrupted) => return Some(Outcome::Exit(Exit::Interrupted)),
                Ok(Exit::Left | Exit::Terminal(_)) | Err(_) => continue,
            },
        };
        return Some(Outcome::Failed(Failure::new(
            flow.clone(),
            PartError::new(error.kind, format!("branch '{member}' failed: {}", error.message)),
        )));
    }
    None
}

#[allow(clippy::too_many_arguments)]
fn merge(
    engine: &Engine,
    track: &mut dyn Track,
    scope: &Scope,
    node: &PartNode,
    members: &[PartId],
    snapshot: &Arc<DataStore>,
    reports: Vec<Report>,
    recovery: Recovery<'_>,
) -> Result<Outcome, EngineError> {
    let flow = &node.id;
    let mut owners: HashMap<String, usize> = HashMap::new();
    let mut completed = false;

    for (index, report) in reports.into_iter().enumerate() {
        let member = &members[index];
        if engine.cancel.is_cancelled() {
            abandon(track, &members[index..], "branch not merged: the run was interrupted")?;
            track.rollback(snapshot);
            return Ok(Outcome::Exit(Exit::Interrupted));
        }

        let exit = {
            let (first, recorded, view, events) = match report {
                Report::Finished { result, buffer } => (result?, true, buffer.view, buffer.events),
                Report::Missing(error) => (
                    Exit::Halted(Failure::new(member.clone(), error)),
                    false,
                    BranchView::new(Arc::clone(snapshot)),
                    Vec::new(),
                ),
            };
            let mut merging = MergeTrack {
                live: &mut *track,
                view,
                owners: &mut owners,
                flow,
                members,
                index,
            };
            for (part, kind) in events {
                merging.replay(part, kind)?;
            }
            let branch = Scope::Branch(member.clone());
            match first {
                Exit::Halted(failure) if recorded => {
                    engine.drive(&mut merging, &branch, Move::Recover(failure), recovery)?
                }
                // A branch that never reported has no recorded failure yet.
                Exit::Halted(failure) => {
                    engine.drive(&mut merging, &branch, Move::Fail(failure), recovery)?
                }
                other => other,
            }
        };

        match exit {
            Exit::Left => debug!(flow = %flow, member = %member, "Branch merged"),
            Exit::Terminal(TerminationReason::EndedByResearcher) => {
                abandon(
                    track,
                    &members[index + 1..],
                    "branch not merged: the experiment was ended",
                )?;
                return engine.conclude(
                    track,
                    flow,
                    Ok(Target::Terminal(TerminationReason::EndedByResearcher)),
                );
            }
            Exit::Terminal(_) => completed = true,
            Exit::Interrupted => {
                abandon(
                    track,
                    &members[index + 1..],
                    "branch not merged: the run was interrupted",
                )?;
                track.rollback(snapshot);
                return Ok(Outcome::Exit(Exit::Interrupted));
            }
            exit @ (Exit::Suspended { .. } | Exit::Halted(_)) => {
                track.rollback(snapshot);
                return Ok(Outcome::Exit(exit));
            }
        }
    }

    info!(flow = %flow, "Parallel flow merged");
    if completed {
        return engine.conclude(track, flow, Ok(Target::Terminal(TerminationReason::Completed)));
    }
    engine.complete(track, scope, node)
}

fn abandon(track: &mut dyn Track, members: &[PartId], reason: &str) -> Result<(), EngineError> {
    for member in members {
        warn!(member = %member, %reason, "Branch abandoned");
        track.record(
            member,
            EventKind::ErrorRaised {
                kind: FailureKind::Abandoned,
                message: reason.to_string(),
            },
        )?;
    }
    Ok(())
}
