//! Trace events: the durable, ordered record of a run.

use crate::{
    ExecutionPolicy, FailureKind, LegalChoices, PartId, PartKind, Resolution, Value,
};
use serde::{Deserialize, Serialize};

/// One line of the trace.
///
/// Serialized flat as
/// `{"sequence_no", "timestamp", "part_id", "event_kind", "payload"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Position in the run; starts at 0 and has no gaps.
    pub sequence_no: u64,
    /// RFC 3339 wall-clock time the event was recorded.
    pub timestamp: String,
    pub part_id: PartId,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TraceEvent {
    pub fn new(
        sequence_no: u64,
        timestamp: impl Into<String>,
        part_id: PartId,
        kind: EventKind,
    ) -> Self {
        Self {
            sequence_no,
            timestamp: timestamp.into(),
            part_id,
            kind,
        }
    }

    /// The `event_kind` name as written on the wire.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Kind-specific payload of a trace event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_kind", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    PartStarted {
        variant: PartKind,
        type_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        policy: Option<ExecutionPolicy>,
    },
    /// `next` is the resolved successor, or `None` when it did not resolve.
    PartCompleted { next: Option<PartId> },
    DataWritten { key: String, value: Value },
    /// `target` is `None` when the route has no entry in `next_part`.
    DecisionTaken {
        route: String,
        target: Option<PartId>,
    },
    ErrorRaised { kind: FailureKind, message: String },
    ManualResolution(ManualResolution),
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::PartStarted { .. } => "part_started",
            EventKind::PartCompleted { .. } => "part_completed",
            EventKind::DataWritten { .. } => "data_written",
            EventKind::DecisionTaken { .. } => "decision_taken",
            EventKind::ErrorRaised { .. } => "error_raised",
            EventKind::ManualResolution(_) => "manual_resolution",
        }
    }

    /// All wire names, in a stable order.
    pub const NAMES: [&'static str; 6] = [
        "part_started",
        "part_completed",
        "data_written",
        "decision_taken",
        "error_raised",
        "manual_resolution",
    ];
}

/// State of a manual resolution: first the request, then the answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ManualResolution {
    Pending {
        kind: FailureKind,
        reason: String,
        legal_choices: LegalChoices,
    },
    Resolved { choice: Resolution },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(kind: EventKind) -> TraceEvent {
        TraceEvent::new(4, "2026-01-01T00:00:00Z", PartId::new("fan.left"), kind)
    }

    #[test]
    fn test_flat_wire_layout() {
        let ev = event(EventKind::DataWritten {
            key: "fan.x".to_string(),
            value: json!(1),
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["sequence_no"], 4);
        assert_eq!(json["part_id"], "fan.left");
        assert_eq!(json["event_kind"], "data_written");
        assert_eq!(json["payload"], json!({"key": "fan.x", "value": 1}));
    }

    #[test]
    fn test_part_started_omits_absent_policy() {
        let ev = event(EventKind::PartStarted {
            variant: PartKind::Step,
            type_name: "step.set".to_string(),
            policy: None,
        });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(
            json["payload"],
            json!({"variant": "step", "type_name": "step.set"})
        );
    }

    #[test]
    fn test_manual_resolution_parses_from_wire() {
        let line = r#"{"sequence_no":9,"timestamp":"t","part_id":"decide","event_kind":"manual_resolution","payload":{"status":"resolved","choice":{"choice":"part","part_id":"start"}}}"#;
        let ev: TraceEvent = serde_json::from_str(line).unwrap();
        assert_eq!(
            ev.kind,
            EventKind::ManualResolution(ManualResolution::Resolved {
                choice: Resolution::part("start"),
            })
        );
        assert_eq!(ev.kind_name(), "manual_resolution");
    }

    #[test]
    fn test_completed_with_unresolved_next_is_null() {
        let ev = event(EventKind::PartCompleted { next: None });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["payload"], json!({"next": null}));
        let back: TraceEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn test_every_variant_name_is_listed() {
        let kinds = [
            EventKind::PartCompleted { next: None },
            EventKind::ErrorRaised {
                kind: FailureKind::Abandoned,
                message: String::new(),
            },
        ];
        for kind in kinds {
            assert!(EventKind::NAMES.contains(&kind.name()));
        }
    }
}
