//! Failure taxonomy shared by the engine and part implementations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a runtime failure, as recorded in `error_raised` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The current part identifier is not defined in the experiment.
    UnknownPart,
    /// A static next part or decision route is missing or does not resolve.
    UnresolvedNextPart,
    /// The part's own logic failed.
    PartExecutionFailure,
    /// A value could not be represented in the trace format.
    SerializationError,
    /// Two parallel branches wrote the same key. Never halts a run.
    MergeConflict,
    /// A branch or run ended without resolution.
    Abandoned,
}

impl FailureKind {
    /// Returns the name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::UnknownPart => "UnknownPart",
            FailureKind::UnresolvedNextPart => "UnresolvedNextPart",
            FailureKind::PartExecutionFailure => "PartExecutionFailure",
            FailureKind::SerializationError => "SerializationError",
            FailureKind::MergeConflict => "MergeConflict",
            FailureKind::Abandoned => "Abandoned",
        }
    }

    /// Returns true if this kind of failure requires manual resolution.
    pub fn requires_resolution(self) -> bool {
        matches!(
            self,
            FailureKind::UnknownPart
                | FailureKind::UnresolvedNextPart
                | FailureKind::PartExecutionFailure
                | FailureKind::SerializationError
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure returned from part logic or raised by the engine.
///
/// Failures travel as values: part implementations return them from
/// `execute`, parallel branches send them back across the join barrier,
/// and the recovery path turns them into a suspension.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct PartError {
    pub kind: FailureKind,
    pub message: String,
}

impl PartError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A failure inside part logic.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::PartExecutionFailure, message)
    }

    /// A value that cannot be persisted.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(FailureKind::SerializationError, message)
    }

    pub fn unknown_part(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnknownPart, message)
    }

    pub fn unresolved(message: impl Into<String>) -> Self {
        Self::new(FailureKind::UnresolvedNextPart, message)
    }
}

impl From<serde_json::Error> for PartError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_conflict_never_requires_resolution() {
        assert!(!FailureKind::MergeConflict.requires_resolution());
        assert!(!FailureKind::Abandoned.requires_resolution());
        assert!(FailureKind::SerializationError.requires_resolution());
        assert!(FailureKind::UnknownPart.requires_resolution());
    }

    #[test]
    fn test_kind_wire_name_matches_serde() {
        for kind in [
            FailureKind::UnknownPart,
            FailureKind::UnresolvedNextPart,
            FailureKind::PartExecutionFailure,
            FailureKind::SerializationError,
            FailureKind::MergeConflict,
            FailureKind::Abandoned,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_display() {
        let err = PartError::execution("boom");
        assert_eq!(err.to_string(), "PartExecutionFailure: boom");
    }
}
