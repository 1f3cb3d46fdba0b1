//! The manual resolution boundary.

use crate::{FailureKind, PartId};
use serde::{Deserialize, Serialize};

/// Outcomes a researcher may choose when a run cannot continue on its own.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegalChoices {
    /// Parts the run may continue with (the failing part's scope).
    pub parts: Vec<PartId>,
    /// True when the failing part is nested and may leave its flow.
    pub leave_flow: bool,
    /// Ending the experiment is always legal.
    pub end_experiment: bool,
}

impl LegalChoices {
    /// Returns true if `resolution` is one of the offered choices.
    pub fn allows(&self, resolution: &Resolution) -> bool {
        match resolution {
            Resolution::Part { part_id } => self.parts.contains(part_id),
            Resolution::LeaveFlow => self.leave_flow,
            Resolution::EndExperiment => self.end_experiment,
        }
    }
}

/// A synchronous request for a researcher's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionRequest {
    pub part_id: PartId,
    pub kind: FailureKind,
    pub failure_reason: String,
    pub legal_choices: LegalChoices,
}

/// The researcher's answer to a [`ResolutionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum Resolution {
    /// Continue with a specific part.
    Part { part_id: PartId },
    /// Leave the enclosing flow.
    LeaveFlow,
    /// End the experiment.
    EndExperiment,
}

impl Resolution {
    pub fn part(id: impl Into<PartId>) -> Self {
        Resolution::Part {
            part_id: id.into(),
        }
    }
}

/// Supplies resolutions on behalf of the researcher.
///
/// Returning `None` defers the decision: the run suspends with its pending
/// request persisted in the trace and can be resumed later.
pub trait Resolver {
    fn resolve(&self, request: &ResolutionRequest) -> Option<Resolution>;
}

impl<R: Resolver + ?Sized> Resolver for Box<R> {
    fn resolve(&self, request: &ResolutionRequest) -> Option<Resolution> {
        (**self).resolve(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows() {
        let choices = LegalChoices {
            parts: vec![PartId::new("a"), PartId::new("b")],
            leave_flow: false,
            end_experiment: true,
        };
        assert!(choices.allows(&Resolution::part("a")));
        assert!(!choices.allows(&Resolution::part("c")));
        assert!(!choices.allows(&Resolution::LeaveFlow));
        assert!(choices.allows(&Resolution::EndExperiment));
    }

    #[test]
    fn test_resolution_wire_format() {
        let json = serde_json::to_value(Resolution::part("fan.left")).unwrap();
        assert_eq!(json["choice"], "part");
        assert_eq!(json["part_id"], "fan.left");

        let json = serde_json::to_value(Resolution::LeaveFlow).unwrap();
        assert_eq!(json, serde_json::json!({"choice": "leave_flow"}));
    }
}
