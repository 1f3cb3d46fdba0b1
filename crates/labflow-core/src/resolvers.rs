//! Resolvers that need no researcher.

use crate::TraceLog;
use labflow_proto::{
    EventKind, ManualResolution, PartId, Resolution, ResolutionRequest, Resolver,
};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

/// Defers every request, so a failure suspends the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeferResolver;

impl Resolver for DeferResolver {
    fn resolve(&self, _request: &ResolutionRequest) -> Option<Resolution> {
        None
    }
}

/// Answers with the resolutions recorded in an earlier trace, in order,
/// then hands over to `fallback`.
///
/// A recorded answer is used only when it was given for the same part and is
/// legal for the new request; once the runs diverge the fallback answers.
pub struct RecordedResolver<R> {
    recorded: Mutex<VecDeque<(PartId, Resolution)>>,
    fallback: R,
}

impl<R: Resolver> RecordedResolver<R> {
    pub fn from_log(log: &TraceLog, fallback: R) -> Self {
        let recorded = log
            .events()
            .iter()
            .filter_map(|event| match &event.kind {
                EventKind::ManualResolution(ManualResolution::Resolved { choice }) => {
                    Some((event.part_id.clone(), choice.clone()))
                }
                _ => None,
            })
            .collect();
        Self {
            recorded: Mutex::new(recorded),
            fallback,
        }
    }

    /// Recorded answers not used yet.
    pub fn remaining(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<R: Resolver> Resolver for RecordedResolver<R> {
    fn resolve(&self, request: &ResolutionRequest) -> Option<Resolution> {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((part, choice)) = recorded.front() {
            if *part == request.part_id && request.legal_choices.allows(choice) {
                info!(part = %part, ?choice, "Reusing recorded resolution");
                return recorded.pop_front().map(|(_, choice)| choice);
            }
            warn!(
                recorded = %part,
                requested = %request.part_id,
                "Run diverged from the recorded resolutions"
            );
            recorded.clear();
        }
        drop(recorded);
        self.fallback.resolve(request)
    }
}
