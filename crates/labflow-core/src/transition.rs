//! The transition loop.
//!
//! `Engine::drive` advances through the parts of one scope (the top level,
//! a sequential flow, or a single parallel branch) until the scope is left,
//! the experiment ends, or the run has to stop. Failures are plain values
//! that end up at one place, the recovery arm of the loop, which records them
//! and turns them into a manual resolution request.

use crate::experiment::{Experiment, NextPart, PartBody, PartNode};
use crate::manager::TerminationReason;
use crate::{CancelToken, DataStore, EngineError, TraceRecorder, subflow};
use labflow_proto::{
    EventKind, ExecutionPolicy, Inputs, LegalChoices, ManualResolution, Part, PartContext,
    PartError, PartId, PartOutput, PartResult, Resolution, ResolutionRequest, Resolver,
    StoreRead, Value,
};
use std::fmt;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Somewhere the store can be read and events written.
///
/// The live run writes through to the trace and the data store; parallel
/// branches buffer both until their flow merges.
pub(crate) trait Track {
    fn store(&self) -> &dyn StoreRead;

    fn record(&mut self, part: &PartId, kind: EventKind) -> Result<(), EngineError>;

    /// Writes one value, always paired with a `data_written` event.
    fn write_data(&mut self, part: &PartId, key: &str, value: Value) -> Result<(), EngineError>;

    /// A copy of the store as this track sees it.
    fn snapshot(&self) -> DataStore {
        self.store().entries().into_iter().collect()
    }

    /// Returns the store to `fork` when a parallel flow stops before it
    /// finished merging; the trace still holds the partial merge.
    fn rollback(&mut self, _fork: &DataStore) {}
}

/// The live track: the run's own store and trace.
pub(crate) struct LiveTrack<'a, W: Write> {
    pub(crate) store: &'a mut DataStore,
    pub(crate) recorder: &'a mut TraceRecorder<W>,
}

impl<W: Write> Track for LiveTrack<'_, W> {
    fn store(&self) -> &dyn StoreRead {
        &*self.store
    }

    fn record(&mut self, part: &PartId, kind: EventKind) -> Result<(), EngineError> {
        self.recorder.record(part, kind)?;
        Ok(())
    }

    fn write_data(&mut self, part: &PartId, key: &str, value: Value) -> Result<(), EngineError> {
        self.recorder.record(
            part,
            EventKind::DataWritten {
                key: key.to_string(),
                value: value.clone(),
            },
        )?;
        debug!(part = %part, %key, "Data written");
        self.store.set(key, value);
        Ok(())
    }

    fn snapshot(&self) -> DataStore {
        self.store.clone()
    }

    fn rollback(&mut self, fork: &DataStore) {
        self.store.clone_from(fork);
    }
}

/// The region of the experiment a loop runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    Top,
    /// Members of a sequential flow.
    Flow(PartId),
    /// A single member of a parallel flow.
    Branch(PartId),
}

impl Scope {
    /// The flow whose members are siblings in this scope.
    fn flow(&self) -> Option<PartId> {
        match self {
            Scope::Top => None,
            Scope::Flow(flow) => Some(flow.clone()),
            Scope::Branch(member) => member.parent(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Top => write!(f, "the top level"),
            Scope::Flow(flow) => write!(f, "flow '{flow}'"),
            Scope::Branch(member) => write!(f, "branch '{member}'"),
        }
    }
}

/// Where a completed part leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    Part(PartId),
    Leave,
    Terminal(TerminationReason),
}

impl Target {
    /// The identifier written to `part_completed.next` and `decision_taken.target`.
    fn recorded(&self) -> PartId {
        match self {
            Target::Part(id) => id.clone(),
            Target::Leave => PartId::leave_flow(),
            Target::Terminal(_) => PartId::terminal(),
        }
    }
}

/// A failure attributed to a part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Failure {
    pub(crate) part: PartId,
    pub(crate) error: PartError,
}

impl Failure {
    pub(crate) fn new(part: PartId, error: PartError) -> Self {
        Self { part, error }
    }
}

/// The next thing the loop does.
#[derive(Debug)]
pub(crate) enum Move {
    /// Execute a part.
    Run(PartId),
    /// Complete a flow whose body has been left.
    Finish(PartId),
    Go(Target),
    /// Record a failure, then recover.
    Fail(Failure),
    /// Recover from a failure that is already recorded.
    Recover(Failure),
    /// Ask for a resolution that is already recorded as pending.
    Ask(ResolutionRequest),
}

/// Why a scope stopped.
#[derive(Debug)]
pub(crate) enum Exit {
    Left,
    Terminal(TerminationReason),
    /// Waiting on a resolution asked for inside `within` (`None` at the top
    /// level).
    Suspended {
        request: ResolutionRequest,
        within: Option<PartId>,
    },
    Interrupted,
    /// A failure with no resolver available (inside a parallel branch).
    Halted(Failure),
}

/// The result of executing one part.
#[derive(Debug)]
pub(crate) enum Outcome {
    Next(Target),
    Failed(Failure),
    Exit(Exit),
}

/// How failures are handled in a scope.
#[derive(Clone, Copy)]
pub(crate) enum Recovery<'a> {
    Resolve(&'a dyn Resolver),
    /// Stop the scope; the caller deals with the failure.
    Halt,
}

/// Executes parts of an experiment against a track.
#[derive(Clone)]
pub(crate) struct Engine {
    experiment: Arc<Experiment>,
    pub(crate) cancel: CancelToken,
}

impl Engine {
    pub(crate) fn new(experiment: Arc<Experiment>, cancel: CancelToken) -> Self {
        Self { experiment, cancel }
    }

    pub(crate) fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Continues a run inside `frames` (open sequential flows, outermost
    /// first), starting the innermost scope with `entry`.
    pub(crate) fn resume(
        &self,
        track: &mut dyn Track,
        frames: &[PartId],
        entry: Move,
        recovery: Recovery<'_>,
    ) -> Result<Exit, EngineError> {
        self.check_frames(frames)?;
        self.resume_frames(track, frames, entry, recovery)
    }

    fn resume_frames(
        &self,
        track: &mut dyn Track,
        frames: &[PartId],
        entry: Move,
        recovery: Recovery<'_>,
    ) -> Result<Exit, EngineError> {
        match frames.split_last() {
            None => self.drive(track, &Scope::Top, entry, recovery),
            Some((inner, outer)) => {
                match self.drive(track, &Scope::Flow(inner.clone()), entry, recovery)? {
                    Exit::Left => {
                        self.resume_frames(track, outer, Move::Finish(inner.clone()), recovery)
                    }
                    exit => Ok(exit),
                }
            }
        }
    }

    fn check_frames(&self, frames: &[PartId]) -> Result<(), EngineError> {
        let mut parent: Option<&PartId> = None;
        for flow in frames {
            let mismatch = |reason: &str| EngineError::ResumeMismatch {
                flow: flow.clone(),
                reason: reason.to_string(),
            };
            let node = self
                .experiment
                .get(flow)
                .ok_or_else(|| mismatch("the flow is not defined in this experiment"))?;
            if node.policy() != Some(ExecutionPolicy::Sequential) {
                return Err(mismatch("the part is not a sequential flow"));
            }
            if flow.parent().as_ref() != parent {
                return Err(mismatch("the flow is not nested in the enclosing frame"));
            }
            parent = Some(flow);
        }
        Ok(())
    }

    /// Runs the loop in `scope` until it exits.
    pub(crate) fn drive(
        &self,
        track: &mut dyn Track,
        scope: &Scope,
        first: Move,
        recovery: Recovery<'_>,
    ) -> Result<Exit, EngineError> {
        let mut next = first;
        loop {
            next = match next {
                Move::Run(part) => {
                    if self.cancel.is_cancelled() {
                        info!(part = %part, "Run interrupted before part");
                        return Ok(Exit::Interrupted);
                    }
                    match self.step_part(track, scope, &part, recovery)? {
                        Outcome::Next(target) => Move::Go(target),
                        Outcome::Failed(failure) => Move::Fail(failure),
                        Outcome::Exit(exit) => return Ok(exit),
                    }
                }
                Move::Finish(flow) => {
                    let node = self.experiment.get(&flow).ok_or_else(|| {
                        EngineError::ResumeMismatch {
                            flow: flow.clone(),
                            reason: "the flow is not defined in this experiment".to_string(),
                        }
                    })?;
                    match self.complete(track, scope, node)? {
                        Outcome::Next(target) => Move::Go(target),
                        Outcome::Failed(failure) => Move::Fail(failure),
                        Outcome::Exit(exit) => return Ok(exit),
                    }
                }
                Move::Go(Target::Part(id)) => Move::Run(id),
                Move::Go(Target::Leave) => {
                    return Ok(match scope {
                        Scope::Top => Exit::Terminal(TerminationReason::LeftTopLevel),
                        _ => Exit::Left,
                    });
                }
                Move::Go(Target::Terminal(reason)) => return Ok(Exit::Terminal(reason)),
                Move::Fail(failure) => {
                    warn!(
                        part = %failure.part,
                        kind = %failure.error.kind,
                        error = %failure.error.message,
                        "Part failed"
                    );
                    track.record(
                        &failure.part,
                        EventKind::ErrorRaised {
                            kind: failure.error.kind,
                            message: failure.error.message.clone(),
                        },
                    )?;
                    Move::Recover(failure)
                }
                Move::Recover(failure) => match recovery {
                    Recovery::Halt => return Ok(Exit::Halted(failure)),
                    Recovery::Resolve(_) => {
                        let request = self.request_for(scope, failure);
                        track.record(
                            &request.part_id,
                            EventKind::ManualResolution(ManualResolution::Pending {
                                kind: request.kind,
                                reason: request.failure_reason.clone(),
                                legal_choices: request.legal_choices.clone(),
                            }),
                        )?;
                        Move::Ask(request)
                    }
                },
                Move::Ask(request) => {
                    let choice = match recovery {
                        Recovery::Halt => None,
                        Recovery::Resolve(resolver) => self.ask(track, resolver, &request)?,
                    };
                    match choice {
                        Some(target) => Move::Go(target),
                        None => {
                            return Ok(Exit::Suspended {
                                request,
                                within: scope.flow(),
                            });
                        }
                    }
                }
            };
        }
    }

    fn request_for(&self, scope: &Scope, failure: Failure) -> ResolutionRequest {
        let parts = match scope {
            Scope::Top => self.experiment.top_level().to_vec(),
            Scope::Flow(flow) => self.experiment.members_of(Some(flow)).to_vec(),
            Scope::Branch(member) => vec![member.clone()],
        };
        ResolutionRequest {
            part_id: failure.part,
            kind: failure.error.kind,
            failure_reason: failure.error.message,
            legal_choices: LegalChoices {
                parts,
                leave_flow: *scope != Scope::Top,
                end_experiment: true,
            },
        }
    }

    /// Asks the resolver; `None` means the run suspends.
    fn ask(
        &self,
        track: &mut dyn Track,
        resolver: &dyn Resolver,
        request: &ResolutionRequest,
    ) -> Result<Option<Target>, EngineError> {
        info!(part = %request.part_id, kind = %request.kind, "Awaiting manual resolution");
        let Some(choice) = resolver.resolve(request) else {
            info!(part = %request.part_id, "Resolution deferred; suspending run");
            return Ok(None);
        };
        if !request.legal_choices.allows(&choice) {
            warn!(part = %request.part_id, ?choice, "Resolution is not a legal choice; suspending run");
            return Ok(None);
        }

        track.record(
            &request.part_id,
            EventKind::ManualResolution(ManualResolution::Resolved {
                choice: choice.clone(),
            }),
        )?;
        info!(part = %request.part_id, ?choice, "Resolution applied");
        Ok(Some(match choice {
            Resolution::Part { part_id } => Target::Part(part_id),
            Resolution::LeaveFlow => Target::Leave,
            Resolution::EndExperiment => Target::Terminal(TerminationReason::EndedByResearcher),
        }))
    }

    fn step_part(
        &self,
        track: &mut dyn Track,
        scope: &Scope,
        id: &PartId,
        recovery: Recovery<'_>,
    ) -> Result<Outcome, EngineError> {
        let Some(node) = self.experiment.get(id) else {
            return Ok(Outcome::Failed(Failure::new(
                id.clone(),
                PartError::unknown_part(format!("no part named '{id}' is defined")),
            )));
        };

        let inputs = bind_inputs(node, track.store());
        debug!(part = %id, kind = node.kind().as_str(), "Part started");
        track.record(
            id,
            EventKind::PartStarted {
                variant: node.kind(),
                type_name: node.type_name.clone(),
                policy: node.policy(),
            },
        )?;

        match &node.body {
            PartBody::Step(logic) => {
                let result = invoke(logic.as_ref(), id, &inputs, track.store());
                let writes = match result.and_then(|output| bind_outputs(node, output)) {
                    Ok(writes) => writes,
                    Err(error) => return Ok(Outcome::Failed(Failure::new(id.clone(), error))),
                };
                for (key, value) in writes {
                    track.write_data(id, &key, value)?;
                }
                self.complete(track, scope, node)
            }
            PartBody::Decision(logic) => {
                let route = match invoke(logic.as_ref(), id, &inputs, track.store()) {
                    Ok(PartOutput::Route(route)) => route,
                    Ok(PartOutput::Outputs(_)) => {
                        return Ok(Outcome::Failed(Failure::new(
                            id.clone(),
                            PartError::execution("decision returned outputs instead of a route"),
                        )));
                    }
                    Err(error) => return Ok(Outcome::Failed(Failure::new(id.clone(), error))),
                };
                let target = self.resolve_route(scope, node, &route);
                debug!(part = %id, %route, "Decision taken");
                track.record(
                    id,
                    EventKind::DecisionTaken {
                        route,
                        target: target.as_ref().ok().map(Target::recorded),
                    },
                )?;
                self.conclude(track, id, target)
            }
            PartBody::Flow(body) => match body.policy {
                ExecutionPolicy::Sequential => {
                    let first = match &body.start {
                        Some(start) => Move::Run(start.clone()),
                        // The researcher picks the first member.
                        None => Move::Fail(Failure::new(
                            id.clone(),
                            PartError::unresolved(format!("flow '{id}' declares no start_here")),
                        )),
                    };
                    match self.drive(track, &Scope::Flow(id.clone()), first, recovery)? {
                        Exit::Left => self.complete(track, scope, node),
                        exit => Ok(Outcome::Exit(exit)),
                    }
                }
                ExecutionPolicy::Parallel => {
                    subflow::run_parallel(self, track, scope, node, body, recovery)
                }
            },
        }
    }

    /// Records completion of `node` with its static successor.
    pub(crate) fn complete(
        &self,
        track: &mut dyn Track,
        scope: &Scope,
        node: &PartNode,
    ) -> Result<Outcome, EngineError> {
        let next = self.successor(scope, node);
        self.conclude(track, &node.id, next)
    }

    /// Records `part_completed` and turns an unresolved successor into a failure.
    pub(crate) fn conclude(
        &self,
        track: &mut dyn Track,
        id: &PartId,
        next: Result<Target, PartError>,
    ) -> Result<Outcome, EngineError> {
        track.record(
            id,
            EventKind::PartCompleted {
                next: next.as_ref().ok().map(Target::recorded),
            },
        )?;
        Ok(match next {
            Ok(target) => {
                debug!(part = %id, next = %target.recorded(), "Part completed");
                Outcome::Next(target)
            }
            Err(error) => Outcome::Failed(Failure::new(id.clone(), error)),
        })
    }

    fn successor(&self, scope: &Scope, node: &PartNode) -> Result<Target, PartError> {
        if let Scope::Branch(_) = scope {
            return Ok(Target::Leave);
        }
        match &node.next {
            NextPart::Single(target) => self.resolve_target(scope, target),
            NextPart::Routes(_) => Err(PartError::unresolved(format!(
                "'{}' declares routes but is not a decision",
                node.id
            ))),
            NextPart::Unset => Err(PartError::unresolved(format!(
                "'{}' declares no next_part",
                node.id
            ))),
        }
    }

    fn resolve_route(
        &self,
        scope: &Scope,
        node: &PartNode,
        route: &str,
    ) -> Result<Target, PartError> {
        if let Scope::Branch(_) = scope {
            return Ok(Target::Leave);
        }
        let NextPart::Routes(routes) = &node.next else {
            return Err(PartError::unresolved(format!(
                "'{}' chose route '{route}' but declares no routes",
                node.id
            )));
        };
        match routes.get(route) {
            Some(target) => self.resolve_target(scope, target),
            None => Err(PartError::unresolved(format!(
                "route '{route}' has no entry in next_part of '{}'",
                node.id
            ))),
        }
    }

    /// Resolves a configured target: a sentinel, a sibling by name, or a
    /// sibling by absolute identifier.
    fn resolve_target(&self, scope: &Scope, name: &str) -> Result<Target, PartError> {
        if name == PartId::TERMINAL {
            return Ok(Target::Terminal(TerminationReason::Completed));
        }
        if name == PartId::LEAVE_FLOW {
            return Ok(Target::Leave);
        }
        let flow = scope.flow();
        let members = self.experiment.members_of(flow.as_ref());
        let relative = match &flow {
            Some(flow) => flow.child(name),
            None => PartId::new(name),
        };
        if members.contains(&relative) {
            return Ok(Target::Part(relative));
        }
        let absolute = PartId::new(name);
        if members.contains(&absolute) {
            return Ok(Target::Part(absolute));
        }
        Err(PartError::unresolved(format!(
            "next part '{name}' is not a member of {scope}"
        )))
    }
}

fn bind_inputs(node: &PartNode, store: &dyn StoreRead) -> Inputs {
    let mut inputs = Inputs::new();
    for (key, arg) in &node.input_names {
        inputs.bind(arg.clone(), store.get(key).cloned());
    }
    inputs
}

/// Checks every produced result is mapped, then lists the writes in the
/// order the outputs were declared.
fn bind_outputs(node: &PartNode, output: PartOutput) -> Result<Vec<(String, Value)>, PartError> {
    let outputs = match output {
        PartOutput::Outputs(outputs) => outputs,
        PartOutput::Route(route) => {
            return Err(PartError::execution(format!(
                "step returned route '{route}' instead of outputs"
            )));
        }
    };
    if let Some((name, _)) = outputs
        .iter()
        .find(|(name, _)| !node.output_names.contains_key(*name) && !outputs.is_optional(name))
    {
        return Err(PartError::execution(format!(
            "result '{name}' is not mapped to a store key in output_names"
        )));
    }
    Ok(node
        .output_names
        .iter()
        .filter_map(|(result, key)| outputs.get(result).map(|v| (key.clone(), v.clone())))
        .collect())
}

/// Runs part logic, converting a panic into a part failure.
fn invoke(logic: &dyn Part, id: &PartId, inputs: &Inputs, store: &dyn StoreRead) -> PartResult {
    let ctx = PartContext {
        part_id: id,
        inputs,
        store,
    };
    match panic::catch_unwind(AssertUnwindSafe(|| logic.execute(&ctx))) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(PartError::execution(format!("part panicked: {message}")))
        }
    }
}
