//! A resolver that answers from a script.

use labflow_proto::{Resolution, ResolutionRequest, Resolver};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Requests a resolver was asked, in order.
#[derive(Debug, Clone, Default)]
pub struct SeenRequests(Arc<Mutex<Vec<ResolutionRequest>>>);

impl SeenRequests {
    pub fn all(&self) -> Vec<ResolutionRequest> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Answers requests with the scripted resolutions in order, then defers.
#[derive(Debug, Default)]
pub struct ScriptedResolver {
    answers: Mutex<VecDeque<Resolution>>,
    seen: SeenRequests,
}

impl ScriptedResolver {
    pub fn new(answers: impl IntoIterator<Item = Resolution>) -> Self {
        Self {
            answers: Mutex::new(answers.into_iter().collect()),
            seen: SeenRequests::default(),
        }
    }

    /// A resolver that defers every request.
    pub fn deferring() -> Self {
        Self::default()
    }

    /// A handle on the requests this resolver receives.
    pub fn seen(&self) -> SeenRequests {
        self.seen.clone()
    }
}

impl Resolver for ScriptedResolver {
    fn resolve(&self, request: &ResolutionRequest) -> Option<Resolution> {
        self.seen
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}
