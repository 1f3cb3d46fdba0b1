//! The experiment manager: owns the store, the trace and the resolver for
//! one run and drives the transition loop from the start or a resume point.

use crate::transition::{Engine, Exit, Failure, LiveTrack, Move, Recovery, Target};
use crate::{CancelToken, DataStore, EngineError, Experiment, Replay, ReplayCursor, TraceRecorder};
use labflow_proto::{ExecutionPolicy, PartError, PartId, ResolutionRequest, Resolver};
use std::io::Write;
use std::sync::Arc;
use tracing::{info, warn};

/// Why a run reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// A part routed to the terminal sentinel.
    Completed,
    /// The top level was left with "done".
    LeftTopLevel,
    /// A researcher chose to end the experiment while resolving a failure.
    EndedByResearcher,
}

impl TerminationReason {
    /// Every terminal reason is a normal end of the run.
    pub fn exit_code(&self) -> i32 {
        0
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Completed => "completed",
            TerminationReason::LeftTopLevel => "left_top_level",
            TerminationReason::EndedByResearcher => "ended_by_researcher",
        }
    }
}

/// How a call to [`ExperimentManager::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Terminal(TerminationReason),
    /// Waiting on a resolution; the trace holds the pending request.
    Suspended(ResolutionRequest),
    /// Stopped at a part boundary after cancellation.
    Interrupted,
}

impl RunOutcome {
    /// Process exit code for this outcome.
    ///
    /// - 0: the run reached a terminal state
    /// - 3: suspended, resumable
    /// - 130: interrupted (SIGINT = 128 + 2), resumable
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Terminal(reason) => reason.exit_code(),
            RunOutcome::Suspended(_) => 3,
            RunOutcome::Interrupted => 130,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Terminal(reason) => reason.as_str(),
            RunOutcome::Suspended(_) => "suspended",
            RunOutcome::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunOutcome::Terminal(_))
    }
}

/// Lifecycle of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Created,
    Advancing,
    Suspended,
    Interrupted,
    Terminal,
}

/// Where a resumed run picks up.
#[derive(Debug)]
struct ResumePoint {
    frames: Vec<PartId>,
    cursor: ReplayCursor,
}

/// Runs one experiment against one trace.
///
/// The manager is the only writer of its store and its trace. Parts see the
/// store read-only and every write goes through the trace first.
pub struct ExperimentManager<W: Write> {
    experiment: Arc<Experiment>,
    store: DataStore,
    recorder: TraceRecorder<W>,
    resolver: Box<dyn Resolver + Send>,
    cancel: CancelToken,
    state: RunState,
    resume: Option<ResumePoint>,
    /// Set once the run ended or was interrupted; later calls return it.
    stopped: Option<RunOutcome>,
}

impl<W: Write> ExperimentManager<W> {
    /// A fresh run seeded with the experiment's initial values.
    pub fn new(
        experiment: Arc<Experiment>,
        recorder: TraceRecorder<W>,
        resolver: Box<dyn Resolver + Send>,
    ) -> Self {
        let store = experiment.initial_store();
        Self {
            experiment,
            store,
            recorder,
            resolver,
            cancel: CancelToken::new(),
            state: RunState::Created,
            resume: None,
            stopped: None,
        }
    }

    /// A run that continues where `replay` left off.
    ///
    /// `recorder` must append to the replayed trace.
    pub fn resuming(
        experiment: Arc<Experiment>,
        replay: Replay,
        recorder: TraceRecorder<W>,
        resolver: Box<dyn Resolver + Send>,
    ) -> Self {
        if recorder.next_sequence() != replay.next_sequence() {
            warn!(
                recorder = recorder.next_sequence(),
                trace = replay.next_sequence(),
                "Recorder does not continue the replayed trace"
            );
        }
        let frames = replay.frames().to_vec();
        let cursor = replay.cursor().clone();
        let state = match cursor {
            ReplayCursor::Finished(_) => RunState::Terminal,
            ReplayCursor::Pending(_) => RunState::Suspended,
            _ => RunState::Created,
        };
        Self {
            experiment,
            store: replay.into_store(),
            recorder,
            resolver,
            cancel: CancelToken::new(),
            state,
            resume: Some(ResumePoint { frames, cursor }),
            stopped: None,
        }
    }

    /// Uses `cancel` to stop the run at the next part boundary.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn recorder(&self) -> &TraceRecorder<W> {
        &self.recorder
    }

    pub fn recorder_mut(&mut self) -> &mut TraceRecorder<W> {
        &mut self.recorder
    }

    pub fn into_parts(self) -> (DataStore, TraceRecorder<W>) {
        (self.store, self.recorder)
    }

    /// Advances the run until it ends, suspends or is interrupted.
    ///
    /// Calling `run` again after a suspension asks the resolver again. After
    /// an interruption the run continues only through a replay of its trace,
    /// so later calls return the same outcome.
    pub fn run(&mut self) -> Result<RunOutcome, EngineError> {
        if let Some(outcome) = &self.stopped {
            return Ok(outcome.clone());
        }
        let (frames, entry) = match self.resume.take() {
            None => {
                let start = self.experiment.start().ok_or(EngineError::NoStartPart)?;
                info!(experiment = %self.experiment.name(), start = %start, "Starting run");
                (Vec::new(), Move::Run(start.clone()))
            }
            Some(point) => {
                info!(
                    experiment = %self.experiment.name(),
                    depth = point.frames.len(),
                    cursor = ?point.cursor,
                    "Resuming run"
                );
                let entry = match point.cursor {
                    ReplayCursor::Finished(reason) => {
                        self.state = RunState::Terminal;
                        self.stopped = Some(RunOutcome::Terminal(reason));
                        info!(reason = reason.as_str(), "Run already finished");
                        return Ok(RunOutcome::Terminal(reason));
                    }
                    ReplayCursor::Fresh => match self.experiment.start() {
                        Some(start) => Move::Run(start.clone()),
                        None => return Err(EngineError::NoStartPart),
                    },
                    ReplayCursor::At(part) => Move::Run(part),
                    ReplayCursor::Leave => Move::Go(Target::Leave),
                    ReplayCursor::Unresolved(part) => Move::Fail(Failure::new(
                        part.clone(),
                        PartError::unresolved(format!("next part of '{part}' did not resolve")),
                    )),
                    ReplayCursor::Failed {
                        part,
                        kind,
                        message,
                    } => Move::Recover(Failure::new(part, PartError::new(kind, message))),
                    ReplayCursor::Pending(request) => Move::Ask(request),
                };
                (point.frames, entry)
            }
        };

        self.state = RunState::Advancing;
        let engine = Engine::new(Arc::clone(&self.experiment), self.cancel.clone());
        let mut track = LiveTrack {
            store: &mut self.store,
            recorder: &mut self.recorder,
        };
        let recovery = Recovery::Resolve(self.resolver.as_ref());
        let exit = engine.resume(&mut track, &frames, entry, recovery)?;

        let outcome = match exit {
            Exit::Terminal(reason) => RunOutcome::Terminal(reason),
            Exit::Left => RunOutcome::Terminal(TerminationReason::LeftTopLevel),
            Exit::Suspended { request, within } => {
                self.resume = Some(self.suspended_at(request.clone(), within));
                RunOutcome::Suspended(request)
            }
            Exit::Interrupted => RunOutcome::Interrupted,
            Exit::Halted(failure) => {
                return Err(EngineError::Unrecovered {
                    part: failure.part,
                    message: failure.error.message,
                });
            }
        };

        self.state = match outcome {
            RunOutcome::Terminal(_) => RunState::Terminal,
            RunOutcome::Suspended(_) => RunState::Suspended,
            RunOutcome::Interrupted => RunState::Interrupted,
        };
        if !matches!(outcome, RunOutcome::Suspended(_)) {
            self.stopped = Some(outcome.clone());
        }
        info!(outcome = outcome.as_str(), "Run stopped");
        Ok(outcome)
    }

    /// Where the next call to `run` continues after a suspension inside
    /// `within`: the pending request, or the start of the parallel flow it
    /// happened in, the same place a replay of the trace would continue from.
    fn suspended_at(&self, request: ResolutionRequest, within: Option<PartId>) -> ResumePoint {
        let mut frames = Vec::new();
        let mut current = within;
        while let Some(flow) = current {
            current = flow.parent();
            frames.push(flow);
        }
        frames.reverse();

        let parallel = frames.iter().position(|flow| {
            self.experiment.get(flow).and_then(|node| node.policy())
                != Some(ExecutionPolicy::Sequential)
        });
        match parallel {
            Some(index) => {
                let restart = frames[index].clone();
                frames.truncate(index);
                ResumePoint {
                    frames,
                    cursor: ReplayCursor::At(restart),
                }
            }
            None => ResumePoint {
                frames,
                cursor: ReplayCursor::Pending(request),
            },
        }
    }
}
