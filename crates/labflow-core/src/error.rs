//! Errors that abort trace handling or a run.
//!
//! Failures of individual parts are not represented here: they are values
//! (`PartError`) recorded in the trace and routed to manual resolution.

use labflow_proto::PartId;

/// Errors reading or writing a trace file.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode trace event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("trace sequence broken at line {line}: expected sequence_no {expected}, found {found}")]
    SequenceGap { line: u64, expected: u64, found: u64 },
}

/// Conditions that stop the engine outright.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("trace could not be persisted: {0}")]
    Trace(#[from] TraceError),

    #[error("cannot resume inside '{flow}': {reason}")]
    ResumeMismatch { flow: PartId, reason: String },

    #[error("experiment has no part to start from")]
    NoStartPart,

    #[error("failure in '{part}' was not recovered: {message}")]
    Unrecovered { part: PartId, message: String },
}
